//! Tracker manager actor.
//!
//! All scanner events and user commands are funnelled into a single task
//! that owns the [`Binding`] state machine, so every advertisement is fully
//! processed before the next event or query is served.

use log::{debug, info};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, Instant, Interval, MissedTickBehavior},
};

use crate::{
   airpods::{
      binding::{Binding, TrackerStats},
      device::Snapshot,
      fingerprint::Fingerprint,
   },
   bluetooth::scanner::ScannerEvent,
   config::TrackerSettings,
   error::{Result, TrackerError},
   event::EventSender,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   StartDiscovery(oneshot::Sender<Result<()>>),
   Bind(Fingerprint, oneshot::Sender<Result<()>>),
   BindSole(oneshot::Sender<Result<Fingerprint>>),
   Unbind(oneshot::Sender<Result<()>>),
   Restore(Fingerprint, oneshot::Sender<()>),
   GetSnapshot(oneshot::Sender<Snapshot>),
   ListCandidates(oneshot::Sender<Vec<serde_json::Value>>),
   GetStats(oneshot::Sender<TrackerStats>),
}

// === Main Manager ===

/// Handle to the tracker actor.
///
/// Cloning the handle is cheap; the actor stops once every handle is gone.
#[derive(Clone)]
pub struct TrackerManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl TrackerManager {
   pub fn new(
      settings: TrackerSettings,
      event_tx: EventSender,
      scanner_rx: mpsc::Receiver<ScannerEvent>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(settings, event_tx, command_rx, scanner_rx).run());
      Self { inbox: command_tx }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| TrackerError::ManagerShutdown)?;
      rx.await.map_err(|_| TrackerError::ManagerShutdown)
   }

   pub async fn start_discovery(&self) -> Result<()> {
      self.request(ManagerCommand::StartDiscovery).await?
   }

   pub async fn bind(&self, fingerprint: Fingerprint) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Bind(fingerprint, tx))
         .await?
   }

   pub async fn bind_sole(&self) -> Result<Fingerprint> {
      self.request(ManagerCommand::BindSole).await?
   }

   pub async fn unbind(&self) -> Result<()> {
      self.request(ManagerCommand::Unbind).await?
   }

   /// Rehydrates a persisted binding.
   pub async fn restore(&self, fingerprint: Fingerprint) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Restore(fingerprint, tx))
         .await
   }

   pub async fn snapshot(&self) -> Result<Snapshot> {
      self.request(ManagerCommand::GetSnapshot).await
   }

   pub async fn list_candidates(&self) -> Result<Vec<serde_json::Value>> {
      self.request(ManagerCommand::ListCandidates).await
   }

   pub async fn stats(&self) -> Result<TrackerStats> {
      self.request(ManagerCommand::GetStats).await
   }
}

// === Manager Actor ===

/// Periodic tick bound to one binding. Replaced whenever the bound device
/// changes so a previous binding's deadline can never fire.
struct Ticker {
   owner: Option<Fingerprint>,
   interval: Interval,
}

struct ManagerActor {
   binding: Binding,
   command_rx: mpsc::Receiver<ManagerCommand>,
   scanner_rx: mpsc::Receiver<ScannerEvent>,
   ticker: Option<Ticker>,
}

fn now() -> std::time::Instant {
   Instant::now().into_std()
}

async fn next_tick(ticker: &mut Option<Ticker>) {
   match ticker {
      Some(t) => {
         t.interval.tick().await;
      },
      None => std::future::pending().await,
   }
}

impl ManagerActor {
   fn new(
      settings: TrackerSettings,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
      scanner_rx: mpsc::Receiver<ScannerEvent>,
   ) -> Self {
      Self {
         binding: Binding::new(settings, event_tx),
         command_rx,
         scanner_rx,
         ticker: None,
      }
   }

   async fn run(mut self) {
      info!("Tracker manager starting up");

      // Main event loop. Pending advertisements are drained before commands
      // so queries see every event received so far.
      loop {
         select! {
             biased;
             Some(event) = self.scanner_rx.recv() => {
                 self.handle_scanner_event(event);
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Tracker manager shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             () = next_tick(&mut self.ticker) => {
                 self.binding.tick(now());
             }
         }
         self.sync_ticker();
      }
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      let now = now();
      match cmd {
         ManagerCommand::StartDiscovery(reply) => {
            let _ = reply.send(self.binding.start_discovery(now));
         },
         ManagerCommand::Bind(fp, reply) => {
            let _ = reply.send(self.binding.bind(fp, now));
         },
         ManagerCommand::BindSole(reply) => {
            let _ = reply.send(self.binding.bind_sole(now));
         },
         ManagerCommand::Unbind(reply) => {
            let _ = reply.send(self.binding.unbind(now));
         },
         ManagerCommand::Restore(fp, reply) => {
            self.binding.restore(fp, now);
            let _ = reply.send(());
         },
         ManagerCommand::GetSnapshot(reply) => {
            let _ = reply.send(self.binding.snapshot(now));
         },
         ManagerCommand::ListCandidates(reply) => {
            let list = self
               .binding
               .candidates()
               .iter()
               .map(|c| c.to_json(now))
               .collect();
            let _ = reply.send(list);
         },
         ManagerCommand::GetStats(reply) => {
            let _ = reply.send(self.binding.stats());
         },
      }
   }

   fn handle_scanner_event(&mut self, event: ScannerEvent) {
      match event {
         ScannerEvent::Advertisement(adv) => self.binding.handle_advertisement(&adv),
         ScannerEvent::Radio(radio) => {
            self.binding.set_radio(radio, now());
         },
      }
   }

   /// Starts, restarts or stops the ticker to follow the binding.
   fn sync_ticker(&mut self) {
      let wanted = self
         .binding
         .needs_ticker()
         .then(|| self.binding.bound_fingerprint());
      if wanted == self.ticker.as_ref().map(|t| t.owner) {
         return;
      }

      self.ticker = wanted.map(|owner| {
         let period = self.binding.settings().tick_interval;
         debug!("Starting ticker every {period:?} ({})", self.binding.state());
         let mut interval = time::interval_at(Instant::now() + period, period);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         Ticker { owner, interval }
      });
      if self.ticker.is_none() {
         debug!("Ticker stopped");
      }
   }
}
