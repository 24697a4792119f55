//! Debouncing and smoothing of decoded status.
//!
//! The two earbuds take turns broadcasting, each advertisement only carries a
//! partial view, and individual readings are noisy. This module merges the
//! per-side views and commits noisy fields only after sustained agreement.

use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::airpods::{
   device::UpdateOp,
   protocol::{Battery, CaseStatus, DecodedStatus, Model, PodLayout, PodStatus, Side},
};

/// How long a changed value must persist before it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum DebouncePolicy {
   /// Commit after this many consecutive agreeing observations.
   Samples { samples: u32 },
   /// Commit once the new value has been observed continuously for this long.
   Duration { millis: u64 },
}

impl Default for DebouncePolicy {
   fn default() -> Self {
      Self::Samples { samples: 3 }
   }
}

impl DebouncePolicy {
   fn is_satisfied(self, count: u32, elapsed: Duration) -> bool {
      match self {
         Self::Samples { samples } => count >= samples,
         Self::Duration { millis } => elapsed >= Duration::from_millis(millis),
      }
   }
}

#[derive(Debug, Clone, Copy)]
struct Pending<T> {
   value: T,
   count: u32,
   since: Instant,
}

/// A value that only changes after the change has been observed consistently.
#[derive(Debug, Clone)]
pub struct Debounced<T> {
   policy: DebouncePolicy,
   committed: Option<T>,
   pending: Option<Pending<T>>,
}

impl<T: Copy + PartialEq> Debounced<T> {
   pub const fn new(policy: DebouncePolicy) -> Self {
      Self {
         policy,
         committed: None,
         pending: None,
      }
   }

   pub const fn value(&self) -> Option<T> {
      self.committed
   }

   /// Feeds one observation. The first observation is committed immediately.
   pub fn observe(&mut self, value: T, now: Instant) -> UpdateOp<T> {
      let Some(committed) = self.committed else {
         self.pending = None;
         return UpdateOp::new(self.committed.replace(value), Some(value));
      };

      if committed == value {
         self.pending = None;
         return UpdateOp::Noop;
      }

      let pending = match &mut self.pending {
         Some(p) if p.value == value => {
            p.count += 1;
            *p
         },
         slot => *slot.insert(Pending {
            value,
            count: 1,
            since: now,
         }),
      };

      if self
         .policy
         .is_satisfied(pending.count, now.saturating_duration_since(pending.since))
      {
         self.pending = None;
         UpdateOp::new(self.committed.replace(value), Some(value))
      } else {
         UpdateOp::Noop
      }
   }

   pub fn reset(&mut self) {
      self.committed = None;
      self.pending = None;
   }
}

/// Smoothed device status as exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmoothedStatus {
   pub model: Model,
   pub layout: PodLayout,
   pub left: PodStatus,
   pub right: PodStatus,
   pub case: CaseStatus,
}

impl SmoothedStatus {
   pub const fn both_in_ear(&self) -> bool {
      self.left.in_ear && self.right.in_ear
   }

   /// Lid open with both pods still in the case.
   pub const fn lid_opened(&self) -> bool {
      self.case.lid_open && self.case.both_in_case
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "model": self.model.to_str(),
          "layout": self.layout.to_string(),
          "left": self.left.to_json(),
          "right": self.right.to_json(),
          "case": self.case.to_json(),
          "both_in_ear": self.both_in_ear(),
      })
   }
}

/// Ear-presence after a committed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarPresence {
   pub left: bool,
   pub right: bool,
}

/// Result of feeding one status into the smoother.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmoothUpdate {
   pub changed: bool,
   pub ear_presence: Option<EarPresence>,
   /// New both-in-ear value, set only when it flipped.
   pub both_in_ear: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
struct SideSample {
   status: DecodedStatus,
   at: Instant,
}

/// Units of the device whose fields are picked independently.
#[derive(Debug, Clone, Copy)]
enum Unit {
   Left,
   Right,
   Case,
}

impl Unit {
   const fn battery(self, status: &DecodedStatus) -> Battery {
      match self {
         Self::Left => status.left.battery,
         Self::Right => status.right.battery,
         Self::Case => status.case.battery,
      }
   }
}

/// Merges both earbuds' broadcasts and debounces noisy fields.
#[derive(Debug, Clone)]
pub struct StatusSmoother {
   side_stale_timeout: Duration,
   sides: [Option<SideSample>; 2],
   merged: Option<SmoothedStatus>,
   left_in_ear: Debounced<bool>,
   right_in_ear: Debounced<bool>,
   lid_open: Debounced<bool>,
}

const fn side_index(side: Side) -> usize {
   match side {
      Side::Left => 0,
      Side::Right => 1,
   }
}

impl StatusSmoother {
   pub const fn new(policy: DebouncePolicy, side_stale_timeout: Duration) -> Self {
      Self {
         side_stale_timeout,
         sides: [None, None],
         merged: None,
         left_in_ear: Debounced::new(policy),
         right_in_ear: Debounced::new(policy),
         lid_open: Debounced::new(policy),
      }
   }

   pub const fn current(&self) -> Option<SmoothedStatus> {
      self.merged
   }

   /// Clears everything, including known battery levels. Only used after
   /// loss of contact or unbind.
   pub fn reset(&mut self) {
      self.sides = [None, None];
      self.merged = None;
      self.left_in_ear.reset();
      self.right_in_ear.reset();
      self.lid_open.reset();
   }

   /// Drops per-side samples that have not been refreshed recently. Committed
   /// values are kept.
   pub fn expire_sides(&mut self, now: Instant) {
      let timeout = self.side_stale_timeout;
      for (slot, side) in self.sides.iter_mut().zip([Side::Left, Side::Right]) {
         if slot.is_some_and(|s| now.saturating_duration_since(s.at) >= timeout) {
            debug!("No recent broadcast from {side} side, dropping its sample");
            *slot = None;
         }
      }
   }

   /// Picks, for one unit, the freshest side sample that knows its battery.
   fn pick(&self, unit: Unit) -> Option<&DecodedStatus> {
      let fresh = self.sides.iter().flatten();
      fresh
         .clone()
         .filter(|s| unit.battery(&s.status).is_known())
         .max_by_key(|s| s.at)
         .or_else(|| fresh.max_by_key(|s| s.at))
         .map(|s| &s.status)
   }

   pub fn observe(&mut self, status: DecodedStatus, now: Instant) -> SmoothUpdate {
      self.sides[side_index(status.side)] = Some(SideSample { status, at: now });

      let (Some(left_src), Some(right_src), Some(case_src)) =
         (self.pick(Unit::Left), self.pick(Unit::Right), self.pick(Unit::Case))
      else {
         return SmoothUpdate::default();
      };
      let (left_src, right_src, case_src) = (left_src.left, right_src.right, case_src.case);

      let prev = self.merged;
      let keep = |new: Battery, old: Option<Battery>| match (new, old) {
         (Battery::Unknown, Some(old)) => old,
         (new, _) => new,
      };

      // Debounced fields only see the frame that just arrived.
      let left_op = self.left_in_ear.observe(status.left.in_ear, now);
      let right_op = self.right_in_ear.observe(status.right.in_ear, now);
      self.lid_open.observe(status.case.lid_open, now);

      let model = if status.model.is_known() {
         status.model
      } else {
         prev.map_or(status.model, |p| p.model)
      };

      let merged = SmoothedStatus {
         model,
         layout: model.layout(),
         left: PodStatus {
            battery: keep(left_src.battery, prev.map(|p| p.left.battery)),
            charging: left_src.charging,
            in_ear: self.left_in_ear.value().unwrap_or(false),
         },
         right: PodStatus {
            battery: keep(right_src.battery, prev.map(|p| p.right.battery)),
            charging: right_src.charging,
            in_ear: self.right_in_ear.value().unwrap_or(false),
         },
         case: CaseStatus {
            battery: keep(case_src.battery, prev.map(|p| p.case.battery)),
            charging: case_src.charging,
            lid_open: self.lid_open.value().unwrap_or(false),
            both_in_case: case_src.both_in_case,
         },
      };
      self.merged = Some(merged);

      let ear_presence =
         (left_op.is_transition() || right_op.is_transition()).then_some(EarPresence {
            left: merged.left.in_ear,
            right: merged.right.in_ear,
         });

      let both_in_ear = prev
         .is_some_and(|p| p.both_in_ear() != merged.both_in_ear())
         .then_some(merged.both_in_ear());

      SmoothUpdate {
         changed: prev != Some(merged),
         ear_presence,
         both_in_ear,
      }
   }
}
