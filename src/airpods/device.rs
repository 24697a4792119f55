//! Bound device record and state snapshots.
//!
//! This module provides the [`BoundDevice`] type, the single device the user
//! selected, together with the snapshot handed out to collaborators.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::{
   airpods::{
      fingerprint::Fingerprint,
      protocol::{DecodedStatus, Model},
      smoothing::{DebouncePolicy, SmoothUpdate, SmoothedStatus, StatusSmoother},
   },
   bluetooth::scanner::RadioState,
};

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   pub fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   /// True only when an existing value changed to another value.
   pub const fn is_transition(&self) -> bool {
      matches!(self, Self::Updated(_))
   }
}

/// Lifecycle of the binding between the service and a physical device.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
   Unbound,
   Discovering,
   BoundDisconnected,
   BoundConnected,
}

impl BindingState {
   pub const fn is_bound(self) -> bool {
      matches!(self, Self::BoundConnected | Self::BoundDisconnected)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// The device the user cares about.
#[derive(Debug, Clone)]
pub struct BoundDevice {
   fingerprint: Fingerprint,
   model: Model,
   last_seen: Option<Instant>,
   smoother: StatusSmoother,
   reconnect_streak: u32,
}

impl BoundDevice {
   pub fn new(fingerprint: Fingerprint, debounce: DebouncePolicy, side_stale: Duration) -> Self {
      Self {
         fingerprint,
         model: Model::from_id(fingerprint.model_id()),
         last_seen: None,
         smoother: StatusSmoother::new(debounce, side_stale),
         reconnect_streak: 0,
      }
   }

   pub const fn fingerprint(&self) -> Fingerprint {
      self.fingerprint
   }

   pub const fn model(&self) -> Model {
      self.model
   }

   pub const fn status(&self) -> Option<SmoothedStatus> {
      self.smoother.current()
   }

   /// Time since the last matching advertisement, if any was seen.
   pub fn silence(&self, now: Instant) -> Option<Duration> {
      self.last_seen.map(|t| now.saturating_duration_since(t))
   }

   /// Records a matching advertisement. `gap_limit` bounds how far apart two
   /// advertisements may be to count as consecutive for reconnection.
   pub fn record(&mut self, status: DecodedStatus, now: Instant, gap_limit: Duration) -> SmoothUpdate {
      let consecutive = self
         .silence(now)
         .is_some_and(|gap| gap < gap_limit);
      self.reconnect_streak = if consecutive {
         self.reconnect_streak.saturating_add(1)
      } else {
         1
      };
      self.last_seen = Some(now);
      if status.model.is_known() {
         self.model = status.model;
      }
      self.smoother.observe(status, now)
   }

   pub const fn reconnect_streak(&self) -> u32 {
      self.reconnect_streak
   }

   pub fn expire_sides(&mut self, now: Instant) {
      self.smoother.expire_sides(now);
   }

   /// Forgets all smoothed status after loss of contact.
   pub fn lose_contact(&mut self) {
      self.smoother.reset();
      self.reconnect_streak = 0;
   }
}

/// Point-in-time view of the tracker handed out to collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
   pub state: BindingState,
   pub fingerprint: Option<Fingerprint>,
   pub model: Option<Model>,
   pub last_seen_secs: Option<u64>,
   pub status: Option<SmoothedStatus>,
   pub radio: RadioState,
}

impl Snapshot {
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "state": self.state.to_str(),
          "radio_available": self.radio.is_available(),
      });
      if let RadioState::Unavailable(reason) = &self.radio {
         info["radio_error"] = json!(reason.as_str());
      }
      if let Some(fp) = self.fingerprint {
         info["fingerprint"] = json!(fp.to_string());
      }
      if let Some(model) = self.model {
         info["model"] = json!(model.to_str());
      }
      if let Some(secs) = self.last_seen_secs {
         info["last_seen_secs"] = json!(secs);
      }
      if let Some(status) = self.status {
         info["status"] = status.to_json();
      }
      info
   }
}
