//! Configuration management for the tracker service.
//!
//! This module handles loading and saving configuration from disk,
//! including the bound device and the timing parameters of the tracker.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   airpods::{fingerprint::Fingerprint, smoothing::DebouncePolicy},
   error::{Result, TrackerError},
};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Fingerprint of the device to restore on startup.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub bound_device: Option<Fingerprint>,

   #[serde(default = "default_liveness_timeout")]
   pub liveness_timeout_sec: u64,

   #[serde(default = "default_tick_interval")]
   pub tick_interval_ms: u64,

   #[serde(default = "default_side_stale_timeout")]
   pub side_stale_timeout_sec: u64,

   #[serde(default = "default_candidate_ttl")]
   pub candidate_ttl_sec: u64,

   #[serde(default = "default_rssi_min")]
   pub rssi_min: i16,

   #[serde(default)]
   pub debounce: DebouncePolicy,

   #[serde(default = "default_reconnect_samples")]
   pub reconnect_samples: u32,

   /// Report both-in-ear transitions for media control.
   #[serde(default = "default_automatic_ear_detection")]
   pub automatic_ear_detection: bool,
}

const fn default_liveness_timeout() -> u64 {
   15
}

const fn default_tick_interval() -> u64 {
   1000
}

const fn default_side_stale_timeout() -> u64 {
   10
}

const fn default_candidate_ttl() -> u64 {
   30
}

const fn default_rssi_min() -> i16 {
   -80
}

const fn default_reconnect_samples() -> u32 {
   2
}

const fn default_automatic_ear_detection() -> bool {
   true
}

impl Default for Config {
   fn default() -> Self {
      Self {
         bound_device: None,
         liveness_timeout_sec: default_liveness_timeout(),
         tick_interval_ms: default_tick_interval(),
         side_stale_timeout_sec: default_side_stale_timeout(),
         candidate_ttl_sec: default_candidate_ttl(),
         rssi_min: default_rssi_min(),
         debounce: DebouncePolicy::default(),
         reconnect_samples: default_reconnect_samples(),
         automatic_ear_detection: default_automatic_ear_detection(),
      }
   }
}

/// Timing and gating parameters of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
   pub liveness_timeout: Duration,
   pub tick_interval: Duration,
   pub side_stale_timeout: Duration,
   pub candidate_ttl: Duration,
   pub rssi_min: i16,
   pub debounce: DebouncePolicy,
   pub reconnect_samples: u32,
   pub automatic_ear_detection: bool,
}

impl Default for TrackerSettings {
   fn default() -> Self {
      Config::default().settings()
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Persists a new bound device to the default location.
   pub fn persist_bound_device(&mut self, fingerprint: Option<Fingerprint>) -> Result<bool> {
      self.set_bound_device(fingerprint, &Self::config_path()?)
   }

   /// Writes `fingerprint` to `config_path` and adopts it only once the
   /// write succeeded. Returns false if it was already stored.
   pub fn set_bound_device(
      &mut self,
      fingerprint: Option<Fingerprint>,
      config_path: &Path,
   ) -> Result<bool> {
      if self.bound_device == fingerprint {
         return Ok(false);
      }
      let updated = Self {
         bound_device: fingerprint,
         ..self.clone()
      };
      updated.save_to(config_path)?;
      *self = updated;
      Ok(true)
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(podtrack_home) = env::var("PODTRACK_HOME") {
         PathBuf::from(podtrack_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(TrackerError::ConfigDirNotFound);
      };

      Ok(config_dir.join("podtrackd").join("config.toml"))
   }

   /// Converts the on-disk representation into runtime settings. Zero
   /// intervals are clamped so the ticker never spins.
   pub fn settings(&self) -> TrackerSettings {
      TrackerSettings {
         liveness_timeout: Duration::from_secs(self.liveness_timeout_sec.max(1)),
         tick_interval: Duration::from_millis(self.tick_interval_ms.max(10)),
         side_stale_timeout: Duration::from_secs(self.side_stale_timeout_sec),
         candidate_ttl: Duration::from_secs(self.candidate_ttl_sec),
         rssi_min: self.rssi_min,
         debounce: self.debounce,
         reconnect_samples: self.reconnect_samples.max(1),
         automatic_ear_detection: self.automatic_ear_detection,
      }
   }
}
