use std::str::FromStr;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   airpods::fingerprint::Fingerprint, bluetooth::manager::TrackerManager, error::TrackerError,
};

pub struct TrackerService {
   manager: TrackerManager,
}

impl TrackerService {
   pub const fn new(manager: TrackerManager) -> Self {
      Self { manager }
   }
}

fn to_fdo(e: TrackerError) -> zbus::fdo::Error {
   match e {
      TrackerError::InvalidFingerprint(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
      _ => zbus::fdo::Error::Failed(e.to_string()),
   }
}

#[interface(name = "org.podtrack.Tracker")]
impl TrackerService {
   async fn get_state(&self) -> zbus::fdo::Result<String> {
      let snapshot = self.manager.snapshot().await.map_err(to_fdo)?;
      Ok(snapshot.to_json().to_string())
   }

   async fn list_candidates(&self) -> zbus::fdo::Result<String> {
      let candidates = self.manager.list_candidates().await.map_err(to_fdo)?;
      Ok(serde_json::Value::Array(candidates).to_string())
   }

   async fn start_discovery(&self) -> zbus::fdo::Result<()> {
      self.manager.start_discovery().await.map_err(to_fdo)?;
      info!("Discovery started over D-Bus");
      Ok(())
   }

   async fn bind(&self, fingerprint: String) -> zbus::fdo::Result<()> {
      let fp = Fingerprint::from_str(&fingerprint).map_err(to_fdo)?;
      self.manager.bind(fp).await.map_err(to_fdo)
   }

   /// Binds the only candidate in range and returns its fingerprint.
   async fn bind_sole(&self) -> zbus::fdo::Result<String> {
      let fp = self.manager.bind_sole().await.map_err(to_fdo)?;
      Ok(fp.to_string())
   }

   async fn unbind(&self) -> zbus::fdo::Result<()> {
      self.manager.unbind().await.map_err(to_fdo)
   }

   async fn get_stats(&self) -> zbus::fdo::Result<String> {
      let stats = self.manager.stats().await.map_err(to_fdo)?;
      serde_json::to_string(&stats).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_presence_changed(
      emitter: &SignalEmitter<'_>,
      left: bool,
      right: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn both_in_ear_changed(emitter: &SignalEmitter<'_>, both: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn lid_opened(emitter: &SignalEmitter<'_>, opened: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_lost(emitter: &SignalEmitter<'_>, fingerprint: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn radio_state_changed(
      emitter: &SignalEmitter<'_>,
      available: bool,
      reason: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn candidates_changed(emitter: &SignalEmitter<'_>, count: u32) -> zbus::Result<()>;

   // Refreshed by the dispatcher on every StateChanged
   #[zbus(property)]
   async fn binding_state(&self) -> String {
      self
         .manager
         .snapshot()
         .await
         .map(|s| s.state.to_str().to_owned())
         .unwrap_or_default()
   }
}
