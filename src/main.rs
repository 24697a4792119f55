//! `AirPods` status tracker D-Bus service
//!
//! This service passively listens to Bluetooth LE proximity-pairing
//! advertisements, binds to one pair of earbuds and publishes its smoothed
//! battery, charging, ear-presence and lid state over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::{
   signal,
   sync::{Notify, mpsc},
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{manager::TrackerManager, scanner};
use config::Config;
use dbus::TrackerService;
use event::{EventBus, TrackerEvent};

mod airpods;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;

use crate::{airpods::fingerprint::Fingerprint, dbus::TrackerServiceSignals, error::Result};

const BUS_NAME: &str = "org.podtrack";
const OBJECT_PATH: &str = "/org/podtrack/tracker";
/// Scanner channel buffer size
const SCANNER_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting podtrackd D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   match config.bound_device {
      Some(fp) => info!("Loaded configuration, bound device {fp}"),
      None => info!("Loaded configuration, no bound device"),
   }

   // Create event channel
   let event_bus = EventProcessor::new(config.clone());

   // Create the tracker and restore the persisted binding
   let (scanner_tx, scanner_rx) = mpsc::channel(SCANNER_BUFFER_SIZE);
   let manager = TrackerManager::new(config.settings(), event_bus.clone(), scanner_rx);
   if let Some(fp) = config.bound_device {
      manager.restore(fp).await?;
   }
   let scanner = scanner::spawn(scanner_tx);

   // Create D-Bus service
   let service = TrackerService::new(manager);

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("podtrackd D-Bus service started at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down podtrackd...");
   scanner.abort();

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<TrackerEvent>,
   notifier: Notify,
   config: Mutex<Config>,
}

impl EventProcessor {
   fn new(config: Config) -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         config: Mutex::new(config),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<TrackerEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   /// Stores the bound fingerprint so it survives restarts.
   fn persist_binding(&self, fingerprint: Option<Fingerprint>) -> Result<()> {
      if !self.config.lock().persist_bound_device(fingerprint)? {
         return Ok(());
      }
      match fingerprint {
         Some(fp) => info!("Saved bound device {fp}"),
         None => info!("Cleared bound device"),
      }
      Ok(())
   }

   async fn dispatch(&self, iface: &InterfaceRef<TrackerService>, event: TrackerEvent) -> Result<()> {
      match event {
         TrackerEvent::StateChanged(snapshot) => {
            iface
               .state_changed(&snapshot.to_json().to_string())
               .await?;
            iface
               .get()
               .await
               .binding_state_changed(iface.signal_emitter())
               .await?;
         },
         TrackerEvent::EarPresenceChanged(presence) => {
            iface
               .ear_presence_changed(presence.left, presence.right)
               .await?;
         },
         TrackerEvent::BothInEarChanged(both) => {
            iface.both_in_ear_changed(both).await?;
         },
         TrackerEvent::LidOpened(opened) => {
            iface.lid_opened(opened).await?;
         },
         TrackerEvent::DeviceLost(fp) => {
            iface.device_lost(&fp.to_string()).await?;
         },
         TrackerEvent::CandidatesChanged(count) => {
            iface
               .candidates_changed(u32::try_from(count).unwrap_or(u32::MAX))
               .await?;
         },
         TrackerEvent::RadioStateChanged(radio) => {
            iface
               .radio_state_changed(radio.is_available(), radio.reason())
               .await?;
         },
         TrackerEvent::BindingChanged(fp) => {
            self.persist_binding(fp)?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, TrackerService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: TrackerEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
