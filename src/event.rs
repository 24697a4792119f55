//! Event handling system for tracker state changes.
//!
//! This module provides the event infrastructure for notifying about binding
//! transitions, committed ear-presence and lid changes, loss of contact and
//! radio availability.

use std::sync::Arc;

use crate::{
   airpods::{device::Snapshot, fingerprint::Fingerprint, smoothing::EarPresence},
   bluetooth::scanner::RadioState,
};

/// Events that can be emitted by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
   StateChanged(Snapshot),
   EarPresenceChanged(EarPresence),
   /// Both pods went into or out of the ears. Only emitted with automatic
   /// ear detection enabled.
   BothInEarChanged(bool),
   /// The case lid opened or closed with both pods inside.
   LidOpened(bool),
   DeviceLost(Fingerprint),
   CandidatesChanged(usize),
   RadioStateChanged(RadioState),
   /// The bound fingerprint changed and should be persisted.
   BindingChanged(Option<Fingerprint>),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: TrackerEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
