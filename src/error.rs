//! Error types for the tracker service.
//!
//! This module defines all error types that can occur during the operation
//! of the tracker, including Bluetooth, D-Bus, I/O, configuration and binding
//! command errors.

use smol_str::SmolStr;
use thiserror::Error;

use crate::airpods::fingerprint::Fingerprint;

/// Main error type for the tracker service.
#[derive(Error, Debug)]
pub enum TrackerError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Bluetooth radio unavailable: {0}")]
   RadioUnavailable(SmolStr),

   #[error("Invalid fingerprint: {0}")]
   InvalidFingerprint(SmolStr),

   #[error("A device is already bound")]
   AlreadyBound,

   #[error("No device is bound")]
   NotBound,

   #[error("Not in discovery mode")]
   NotDiscovering,

   #[error("Candidate not found: {0}")]
   CandidateNotFound(Fingerprint),

   #[error("Expected exactly one candidate, found {0}")]
   NoSoleCandidate(usize),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `TrackerError`.
pub type Result<T> = std::result::Result<T, TrackerError>;
