//! Binding state machine.
//!
//! [`Binding`] owns the single device the user selected and drives it
//! through `Unbound → Discovering → BoundDisconnected ↔ BoundConnected`.
//! Every advertisement runs through filter, decoder, matcher and smoother
//! here, to completion, before the next one is handled. It is a plain owned
//! struct; the manager actor is its only caller.

use std::time::Instant;

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::{
   airpods::{
      device::{BindingState, BoundDevice, Snapshot},
      filter::{AdvertisementFilter, FilterStats, RawAdvertisement},
      fingerprint::Fingerprint,
      matcher::{Candidate, DeviceMatcher, MAX_CANDIDATES, MatchOutcome, MatchStats},
      parser::{desensitize, parse_proximity_pairing},
   },
   bluetooth::scanner::RadioState,
   config::TrackerSettings,
   error::{Result, TrackerError},
   event::{EventSender, TrackerEvent},
};

/// Pipeline counters, reported through `GetStats`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
   pub filter: FilterStats,
   pub matcher: MatchStats,
   pub malformed: u64,
   pub unrecognized_model: u64,
   pub rssi_gated: u64,
}

pub struct Binding {
   settings: TrackerSettings,
   state: BindingState,
   filter: AdvertisementFilter,
   matcher: DeviceMatcher,
   bound: Option<BoundDevice>,
   radio: RadioState,
   lid_opened: bool,
   stats: TrackerStats,
   events: EventSender,
}

impl Binding {
   pub fn new(settings: TrackerSettings, events: EventSender) -> Self {
      Self {
         settings,
         state: BindingState::Unbound,
         filter: AdvertisementFilter::new(),
         matcher: DeviceMatcher::new(),
         bound: None,
         radio: RadioState::Available,
         lid_opened: false,
         stats: TrackerStats::default(),
         events,
      }
   }

   pub const fn state(&self) -> BindingState {
      self.state
   }

   pub const fn settings(&self) -> &TrackerSettings {
      &self.settings
   }

   pub fn bound_fingerprint(&self) -> Option<Fingerprint> {
      self.bound.as_ref().map(BoundDevice::fingerprint)
   }

   /// Whether the periodic tick has anything to do.
   pub const fn needs_ticker(&self) -> bool {
      !matches!(self.state, BindingState::Unbound)
   }

   pub fn snapshot(&self, now: Instant) -> Snapshot {
      let bound = self.bound.as_ref();
      Snapshot {
         state: self.state,
         fingerprint: bound.map(BoundDevice::fingerprint),
         model: bound.map(BoundDevice::model),
         last_seen_secs: bound.and_then(|d| d.silence(now)).map(|d| d.as_secs()),
         status: bound.and_then(BoundDevice::status),
         radio: self.radio.clone(),
      }
   }

   pub fn candidates(&self) -> heapless::Vec<Candidate, MAX_CANDIDATES> {
      self.matcher.ranked()
   }

   pub fn stats(&self) -> TrackerStats {
      TrackerStats {
         filter: self.filter.stats(),
         matcher: self.matcher.stats(),
         ..self.stats
      }
   }

   fn transition(&mut self, to: BindingState, now: Instant) {
      if self.state != to {
         info!("Binding state: {} -> {}", self.state, to);
         self.state = to;
      }
      self.sync_lid();
      self.events.emit(TrackerEvent::StateChanged(self.snapshot(now)));
   }

   /// Reports lid transitions with both pods in the case. A device that is
   /// not connected counts as closed.
   fn sync_lid(&mut self) {
      let opened = self.state == BindingState::BoundConnected
         && self
            .bound
            .as_ref()
            .and_then(BoundDevice::status)
            .is_some_and(|s| s.lid_opened());
      if opened != self.lid_opened {
         debug!("Lid opened: {opened}");
         self.lid_opened = opened;
         self.events.emit(TrackerEvent::LidOpened(opened));
      }
   }

   pub fn start_discovery(&mut self, now: Instant) -> Result<()> {
      match self.state {
         BindingState::Discovering => Ok(()),
         state if state.is_bound() => Err(TrackerError::AlreadyBound),
         _ => {
            self.matcher.clear_candidates();
            self.transition(BindingState::Discovering, now);
            self.events.emit(TrackerEvent::CandidatesChanged(0));
            Ok(())
         },
      }
   }

   /// Binds the given candidate. The device starts out connected only if the
   /// candidate was heard within the liveness timeout.
   pub fn bind(&mut self, fp: Fingerprint, now: Instant) -> Result<()> {
      if self.state != BindingState::Discovering {
         return Err(TrackerError::NotDiscovering);
      }
      let candidate = *self
         .matcher
         .candidate(fp)
         .ok_or(TrackerError::CandidateNotFound(fp))?;

      let mut device = BoundDevice::new(
         fp,
         self.settings.debounce,
         self.settings.side_stale_timeout,
      );
      let fresh =
         now.saturating_duration_since(candidate.last_seen) < self.settings.liveness_timeout;
      if fresh {
         self.matcher.clear_tracks();
         self
            .matcher
            .match_bound(fp, candidate.address, candidate.rssi, &candidate.status);
         device.record(
            candidate.status,
            candidate.last_seen,
            self.settings.side_stale_timeout,
         );
      }

      info!("Bound to {fp} ({})", device.model());
      self.bound = Some(device);
      self.matcher.clear_candidates();
      self.events.emit(TrackerEvent::BindingChanged(Some(fp)));
      self.events.emit(TrackerEvent::CandidatesChanged(0));
      let state = if fresh {
         BindingState::BoundConnected
      } else {
         BindingState::BoundDisconnected
      };
      self.transition(state, now);
      Ok(())
   }

   /// Binds the only candidate in range.
   pub fn bind_sole(&mut self, now: Instant) -> Result<Fingerprint> {
      if self.state != BindingState::Discovering {
         return Err(TrackerError::NotDiscovering);
      }
      let ranked = self.matcher.ranked();
      let [sole] = ranked.as_slice() else {
         return Err(TrackerError::NoSoleCandidate(self.matcher.candidate_count()));
      };
      let fp = sole.fingerprint;
      self.bind(fp, now)?;
      Ok(fp)
   }

   pub fn unbind(&mut self, now: Instant) -> Result<()> {
      if self.state == BindingState::Unbound {
         return Err(TrackerError::NotBound);
      }
      if let Some(device) = self.bound.take() {
         info!("Unbound from {}", device.fingerprint());
         self.events.emit(TrackerEvent::BindingChanged(None));
      }
      self.matcher.clear_candidates();
      self.matcher.clear_tracks();
      self.transition(BindingState::Unbound, now);
      Ok(())
   }

   /// Rehydrates a persisted binding. The device is considered absent until
   /// it is heard again.
   pub fn restore(&mut self, fp: Fingerprint, now: Instant) {
      info!("Restoring binding to {fp}");
      self.bound = Some(BoundDevice::new(
         fp,
         self.settings.debounce,
         self.settings.side_stale_timeout,
      ));
      self.matcher.clear_candidates();
      self.matcher.clear_tracks();
      self.transition(BindingState::BoundDisconnected, now);
   }

   /// Records a radio availability change. Returns false if nothing changed.
   pub fn set_radio(&mut self, radio: RadioState, now: Instant) -> bool {
      if self.radio == radio {
         return false;
      }
      match &radio {
         RadioState::Available => info!("Bluetooth radio available"),
         RadioState::Unavailable(reason) => warn!("Bluetooth radio unavailable: {reason}"),
      }
      self.radio = radio.clone();
      self.events.emit(TrackerEvent::RadioStateChanged(radio));
      self.events.emit(TrackerEvent::StateChanged(self.snapshot(now)));
      true
   }

   /// Runs one advertisement through the pipeline. Failures are counted and
   /// never propagate.
   pub fn handle_advertisement(&mut self, adv: &RawAdvertisement) {
      if !self.filter.accept(adv) {
         return;
      }
      if adv.rssi.is_some_and(|rssi| rssi < self.settings.rssi_min) {
         self.stats.rssi_gated += 1;
         return;
      }

      let status = match parse_proximity_pairing(&adv.payload) {
         Ok(status) => status,
         Err(e) => {
            self.stats.malformed += 1;
            debug!(
               "{}: {e} [{}]",
               adv.address,
               hex::encode(desensitize(&adv.payload))
            );
            return;
         },
      };
      if !status.model.is_known() {
         self.stats.unrecognized_model += 1;
      }
      if log::log_enabled!(log::Level::Trace) {
         trace!(
            "{} rssi={:?}: {}",
            adv.address,
            adv.rssi,
            hex::encode(desensitize(&adv.payload))
         );
      }

      let now = adv.timestamp;
      match self.state {
         BindingState::Unbound => {},
         BindingState::Discovering => {
            if let MatchOutcome::Candidate { new: true } =
               self.matcher.observe_candidate(adv.address, adv.rssi, &status, now)
            {
               self
                  .events
                  .emit(TrackerEvent::CandidatesChanged(self.matcher.candidate_count()));
            }
         },
         BindingState::BoundDisconnected | BindingState::BoundConnected => {
            let Some(device) = self.bound.as_mut() else {
               return;
            };
            let outcome =
               self
                  .matcher
                  .match_bound(device.fingerprint(), adv.address, adv.rssi, &status);
            if outcome != MatchOutcome::Matched {
               return;
            }

            let update = device.record(status, now, self.settings.side_stale_timeout);
            if self.state == BindingState::BoundDisconnected {
               if device.reconnect_streak() >= self.settings.reconnect_samples {
                  info!("Bound device {} is back", device.fingerprint());
                  self.transition(BindingState::BoundConnected, now);
               }
               return;
            }

            if let Some(presence) = update.ear_presence {
               debug!("Ear presence: left={} right={}", presence.left, presence.right);
               self.events.emit(TrackerEvent::EarPresenceChanged(presence));
            }
            if let Some(both) = update.both_in_ear {
               if self.settings.automatic_ear_detection {
                  self.events.emit(TrackerEvent::BothInEarChanged(both));
               } else {
                  debug!("Automatic ear detection disabled, ignoring both-in-ear={both}");
               }
            }
            if update.changed {
               self.sync_lid();
               self.events.emit(TrackerEvent::StateChanged(self.snapshot(now)));
            }
         },
      }
   }

   /// Periodic housekeeping: liveness timeout, side expiry and candidate
   /// pruning.
   pub fn tick(&mut self, now: Instant) {
      match self.state {
         BindingState::Unbound => {},
         BindingState::Discovering => {
            let pruned = self.matcher.prune(now, self.settings.candidate_ttl);
            if pruned > 0 {
               debug!("Pruned {pruned} stale candidates");
               self
                  .events
                  .emit(TrackerEvent::CandidatesChanged(self.matcher.candidate_count()));
            }
         },
         BindingState::BoundDisconnected | BindingState::BoundConnected => {
            let timeout = self.settings.liveness_timeout;
            let Some(device) = self.bound.as_mut() else {
               return;
            };
            device.expire_sides(now);
            if self.state != BindingState::BoundConnected
               || !device.silence(now).is_none_or(|silence| silence >= timeout)
            {
               return;
            }

            let fp = device.fingerprint();
            warn!("Lost contact with {fp} after {}s of silence", timeout.as_secs());
            device.lose_contact();
            self.matcher.clear_tracks();
            self.events.emit(TrackerEvent::DeviceLost(fp));
            self.transition(BindingState::BoundDisconnected, now);
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::Arc, time::Duration};

   use bluer::Address;
   use parking_lot::Mutex;

   use super::*;
   use crate::{
      airpods::{
         parser::tests::frame,
         protocol::{
            APPLE_CID, Battery, FLAG_BOTH_IN_CASE, FLAG_BROADCAST_LEFT, FLAG_CURR_IN_EAR,
            FLAG_OTHER_IN_EAR, OFF_LENGTH,
         },
         smoothing::EarPresence,
      },
      event::EventBus,
   };

   #[derive(Default)]
   struct Recorder(Mutex<Vec<TrackerEvent>>);

   impl EventBus for Recorder {
      fn emit(&self, event: TrackerEvent) {
         self.0.lock().push(event);
      }
   }

   impl Recorder {
      fn take(&self) -> Vec<TrackerEvent> {
         std::mem::take(&mut *self.0.lock())
      }

      fn lost(&self) -> usize {
         self
            .0
            .lock()
            .iter()
            .filter(|e| matches!(e, TrackerEvent::DeviceLost(_)))
            .count()
      }
   }

   const SECOND: Duration = Duration::from_secs(1);
   const BOTH_IN: u8 = FLAG_BROADCAST_LEFT | FLAG_CURR_IN_EAR | FLAG_OTHER_IN_EAR;

   fn binding() -> (Binding, Arc<Recorder>) {
      binding_with(TrackerSettings::default())
   }

   fn binding_with(settings: TrackerSettings) -> (Binding, Arc<Recorder>) {
      let recorder = Arc::new(Recorder::default());
      (Binding::new(settings, recorder.clone()), recorder)
   }

   fn addr(n: u8) -> Address {
      Address::new([0x5a, 0x11, 0x22, 0x33, 0x44, n])
   }

   fn advert(n: u8, rssi: i16, color: u8, flags: u8, pods: u8, at: Instant) -> RawAdvertisement {
      RawAdvertisement::new(
         addr(n),
         Some(rssi),
         APPLE_CID,
         &frame(0x2014, flags, pods, 0x05, 0x09, color),
         at,
      )
   }

   fn fp(color: u8) -> Fingerprint {
      Fingerprint::from_bytes([0x01, 0x14, 0x20, color])
   }

   /// Advertisement from F(color 0) with an explicit lid byte.
   fn case_advert(flags: u8, lid: u8, at: Instant) -> RawAdvertisement {
      RawAdvertisement::new(
         addr(1),
         Some(-50),
         APPLE_CID,
         &frame(0x2014, flags, 0x88, 0x05, lid, 0x00),
         at,
      )
   }

   /// Discovers and binds F(color 0) heard at `t0`.
   fn bound_at(t0: Instant) -> (Binding, Arc<Recorder>) {
      bound_with(TrackerSettings::default(), t0)
   }

   fn bound_with(settings: TrackerSettings, t0: Instant) -> (Binding, Arc<Recorder>) {
      let (mut b, rec) = binding_with(settings);
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x88, t0));
      b.bind(fp(0x00), t0).unwrap();
      rec.take();
      (b, rec)
   }

   #[test]
   fn test_discovery_ranks_by_rssi() {
      let t0 = Instant::now();
      let (mut b, rec) = binding();
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(2, -70, 0x01, BOTH_IN, 0x88, t0));
      b.handle_advertisement(&advert(1, -40, 0x00, BOTH_IN, 0x88, t0 + SECOND));
      b.handle_advertisement(&advert(2, -70, 0x01, BOTH_IN, 0x88, t0 + 2 * SECOND));

      let ranked = b.candidates();
      assert_eq!(ranked.len(), 2);
      assert_eq!(ranked[0].fingerprint, fp(0x00));
      assert_eq!(ranked[1].fingerprint, fp(0x01));

      let counts: Vec<usize> = rec
         .take()
         .into_iter()
         .filter_map(|e| match e {
            TrackerEvent::CandidatesChanged(n) => Some(n),
            _ => None,
         })
         .collect();
      assert_eq!(counts, [0, 1, 2]);
   }

   #[test]
   fn test_bind_fresh_candidate_connects() {
      let t0 = Instant::now();
      let (mut b, rec) = binding();
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x98, t0));
      b.bind(fp(0x00), t0 + SECOND).unwrap();

      assert_eq!(b.state(), BindingState::BoundConnected);
      let snap = b.snapshot(t0 + SECOND);
      assert_eq!(snap.fingerprint, Some(fp(0x00)));
      assert_eq!(snap.last_seen_secs, Some(1));
      assert_eq!(snap.status.unwrap().left.battery, Battery::Level(80));
      assert!(b.candidates().is_empty());

      let events = rec.take();
      assert!(events.contains(&TrackerEvent::BindingChanged(Some(fp(0x00)))));
      assert!(matches!(
         events.last(),
         Some(TrackerEvent::StateChanged(s)) if s.state == BindingState::BoundConnected
      ));
   }

   #[test]
   fn test_bind_stale_candidate_starts_disconnected() {
      let t0 = Instant::now();
      let (mut b, _rec) = binding();
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x88, t0));
      b.bind(fp(0x00), t0 + 15 * SECOND).unwrap();
      assert_eq!(b.state(), BindingState::BoundDisconnected);
      assert!(b.snapshot(t0).status.is_none());
   }

   #[test]
   fn test_command_errors() {
      let t0 = Instant::now();
      let (mut b, _rec) = binding();
      assert!(matches!(b.unbind(t0), Err(TrackerError::NotBound)));
      assert!(matches!(b.bind(fp(0), t0), Err(TrackerError::NotDiscovering)));
      assert!(matches!(b.bind_sole(t0), Err(TrackerError::NotDiscovering)));

      b.start_discovery(t0).unwrap();
      assert!(matches!(
         b.bind(fp(7), t0),
         Err(TrackerError::CandidateNotFound(f)) if f == fp(7)
      ));
      assert!(matches!(b.bind_sole(t0), Err(TrackerError::NoSoleCandidate(0))));
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x88, t0));
      b.handle_advertisement(&advert(2, -50, 0x01, BOTH_IN, 0x88, t0));
      assert!(matches!(b.bind_sole(t0), Err(TrackerError::NoSoleCandidate(2))));

      let (mut b, _rec) = bound_at(t0);
      assert!(matches!(b.start_discovery(t0), Err(TrackerError::AlreadyBound)));
   }

   #[test]
   fn test_bind_sole_candidate() {
      let t0 = Instant::now();
      let (mut b, _rec) = binding();
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(1, -50, 0x03, BOTH_IN, 0x88, t0));
      assert_eq!(b.bind_sole(t0).unwrap(), fp(0x03));
      assert_eq!(b.state(), BindingState::BoundConnected);
   }

   #[test]
   fn test_liveness_timeout_fires_exactly_at_expiry() {
      let t0 = Instant::now();
      let (mut b, rec) = bound_at(t0);

      // Advertisements every second for 10 seconds, ticking in between
      for i in 0..10 {
         let at = t0 + i * SECOND;
         b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x88, at));
         b.tick(at);
      }
      let last_seen = t0 + 9 * SECOND;
      for i in 10..24 {
         b.tick(t0 + i * SECOND);
         assert_eq!(b.state(), BindingState::BoundConnected, "lost early at t0+{i}");
      }
      assert_eq!(rec.lost(), 0);

      b.tick(last_seen + Duration::from_secs(15));
      assert_eq!(b.state(), BindingState::BoundDisconnected);
      assert_eq!(rec.lost(), 1);
      assert!(rec.take().contains(&TrackerEvent::DeviceLost(fp(0x00))));
      // Status is cleared together with the connection
      assert!(b.snapshot(t0 + 24 * SECOND).status.is_none());

      b.tick(t0 + 30 * SECOND);
      assert_eq!(rec.lost(), 0);
   }

   #[test]
   fn test_reconnect_requires_consecutive_samples() {
      let t0 = Instant::now();
      let (mut b, _rec) = binding();
      b.restore(fp(0x00), t0);
      assert_eq!(b.state(), BindingState::BoundDisconnected);

      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x77, t0 + SECOND));
      assert_eq!(b.state(), BindingState::BoundDisconnected);
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x77, t0 + 2 * SECOND));
      assert_eq!(b.state(), BindingState::BoundConnected);
      assert_eq!(
         b.snapshot(t0 + 2 * SECOND).status.unwrap().right.battery,
         Battery::Level(70)
      );
   }

   #[test]
   fn test_other_fingerprints_are_ignored() {
      let t0 = Instant::now();
      let (mut b, rec) = bound_at(t0);
      let before = b.snapshot(t0).status;

      // Same model, different color: a neighbour's earbuds
      for i in 1..=5 {
         b.handle_advertisement(&advert(9, -45, 0x01, FLAG_BROADCAST_LEFT, 0x11, t0 + i * SECOND));
      }
      assert_eq!(b.snapshot(t0).status, before);
      assert_eq!(b.stats().matcher.no_match, 5);
      assert!(rec.take().is_empty());

      // The neighbour's adverts do not keep the bound device alive
      b.tick(t0 + 15 * SECOND);
      assert_eq!(b.state(), BindingState::BoundDisconnected);
   }

   #[test]
   fn test_malformed_advert_keeps_battery() {
      let t0 = Instant::now();
      let (mut b, _rec) = bound_at(t0);

      let mut bad = frame(0x2014, BOTH_IN, 0x11, 0x05, 0x09, 0x00);
      bad[OFF_LENGTH] = 0x13;
      b.handle_advertisement(&RawAdvertisement::new(addr(1), Some(-50), APPLE_CID, &bad, t0 + SECOND));
      // Unknown nibbles also keep the previous level
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0xff, t0 + 2 * SECOND));

      let status = b.snapshot(t0).status.unwrap();
      assert_eq!(status.left.battery, Battery::Level(80));
      assert_eq!(status.right.battery, Battery::Level(80));
      assert_eq!(b.stats().malformed, 1);
      assert_eq!(b.state(), BindingState::BoundConnected);
   }

   #[test]
   fn test_rssi_gate_and_foreign_frames() {
      let t0 = Instant::now();
      let (mut b, _rec) = binding();
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(1, -95, 0x00, BOTH_IN, 0x88, t0));
      b.handle_advertisement(&RawAdvertisement::new(addr(2), Some(-40), 0x0075, &[1, 2, 3], t0));
      b.handle_advertisement(&RawAdvertisement::new(
         addr(3),
         Some(-40),
         APPLE_CID,
         &frame(0x2fff, BOTH_IN, 0x88, 0x05, 0, 0),
         t0,
      ));

      let stats = b.stats();
      assert_eq!(stats.rssi_gated, 1);
      assert_eq!(stats.filter.foreign_vendor, 1);
      assert_eq!(stats.unrecognized_model, 1);
      assert_eq!(b.candidates().len(), 1);
   }

   #[test]
   fn test_ear_presence_emitted_on_committed_change() {
      let t0 = Instant::now();
      let (mut b, rec) = bound_at(t0);
      let left_out = FLAG_BROADCAST_LEFT | FLAG_OTHER_IN_EAR;

      for i in 1..=3 {
         b.handle_advertisement(&advert(1, -50, 0x00, left_out, 0x88, t0 + i * SECOND));
      }
      let presence: Vec<EarPresence> = rec
         .take()
         .into_iter()
         .filter_map(|e| match e {
            TrackerEvent::EarPresenceChanged(p) => Some(p),
            _ => None,
         })
         .collect();
      assert_eq!(
         presence,
         [EarPresence {
            left: false,
            right: true
         }]
      );
   }

   #[test]
   fn test_unbind_cancels_previous_timeout() {
      let t0 = Instant::now();
      let (mut b, rec) = bound_at(t0);
      b.unbind(t0 + 5 * SECOND).unwrap();
      assert_eq!(b.state(), BindingState::Unbound);
      assert!(!b.needs_ticker());
      assert!(rec.take().contains(&TrackerEvent::BindingChanged(None)));

      // Bind another device; the old device's expiry (t0+15) must not apply
      b.start_discovery(t0 + 6 * SECOND).unwrap();
      b.handle_advertisement(&advert(2, -50, 0x01, BOTH_IN, 0x88, t0 + 6 * SECOND));
      b.bind(fp(0x01), t0 + 6 * SECOND).unwrap();
      b.tick(t0 + 15 * SECOND);
      assert_eq!(b.state(), BindingState::BoundConnected);
      b.tick(t0 + 21 * SECOND);
      assert_eq!(b.state(), BindingState::BoundDisconnected);
   }

   #[test]
   fn test_radio_state_is_reported() {
      let t0 = Instant::now();
      let (mut b, rec) = binding();
      assert!(b.set_radio(RadioState::Unavailable("no adapter".into()), t0));
      assert!(!b.set_radio(RadioState::Unavailable("no adapter".into()), t0));

      let snap = b.snapshot(t0);
      assert!(!snap.radio.is_available());
      assert!(
         rec
            .take()
            .contains(&TrackerEvent::RadioStateChanged(RadioState::Unavailable("no adapter".into())))
      );
      assert!(b.set_radio(RadioState::Available, t0));
   }

   fn lid_events(rec: &Recorder) -> Vec<bool> {
      rec
         .take()
         .into_iter()
         .filter_map(|e| match e {
            TrackerEvent::LidOpened(opened) => Some(opened),
            _ => None,
         })
         .collect()
   }

   #[test]
   fn test_lid_opened_with_pods_in_case() {
      let t0 = Instant::now();
      let (mut b, rec) = bound_at(t0);
      let in_case = FLAG_BROADCAST_LEFT | FLAG_BOTH_IN_CASE;

      for i in 1..=3 {
         b.handle_advertisement(&case_advert(in_case, 0x01, t0 + i * SECOND));
      }
      assert_eq!(lid_events(&rec), [true]);

      for i in 4..=6 {
         b.handle_advertisement(&case_advert(in_case, 0x09, t0 + i * SECOND));
      }
      assert_eq!(lid_events(&rec), [false]);

      // An open lid with a pod outside the case is not reported
      for i in 7..=9 {
         b.handle_advertisement(&case_advert(FLAG_BROADCAST_LEFT, 0x01, t0 + i * SECOND));
      }
      assert!(lid_events(&rec).is_empty());

      for i in 10..=12 {
         b.handle_advertisement(&case_advert(in_case, 0x01, t0 + i * SECOND));
      }
      assert_eq!(lid_events(&rec), [true]);

      // Losing the device closes the lid for listeners
      b.tick(t0 + 27 * SECOND);
      assert_eq!(b.state(), BindingState::BoundDisconnected);
      assert_eq!(lid_events(&rec), [false]);
   }

   #[test]
   fn test_both_in_ear_follows_ear_detection_setting() {
      for enabled in [true, false] {
         let t0 = Instant::now();
         let settings = TrackerSettings {
            automatic_ear_detection: enabled,
            ..TrackerSettings::default()
         };
         let (mut b, rec) = bound_with(settings, t0);
         let left_out = FLAG_BROADCAST_LEFT | FLAG_OTHER_IN_EAR;

         for i in 1..=3 {
            b.handle_advertisement(&advert(1, -50, 0x00, left_out, 0x88, t0 + i * SECOND));
         }
         let events = rec.take();
         let both: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
               TrackerEvent::BothInEarChanged(both) => Some(*both),
               _ => None,
            })
            .collect();
         let expected: &[bool] = if enabled { &[false] } else { &[] };
         assert_eq!(both, expected);
         // Per-pod presence is reported either way
         assert!(
            events
               .iter()
               .any(|e| matches!(e, TrackerEvent::EarPresenceChanged(_)))
         );
      }
   }

   #[test]
   fn test_discovery_tick_prunes_stale_candidates() {
      let t0 = Instant::now();
      let (mut b, rec) = binding();
      b.start_discovery(t0).unwrap();
      b.handle_advertisement(&advert(1, -50, 0x00, BOTH_IN, 0x88, t0));
      b.handle_advertisement(&advert(2, -50, 0x01, BOTH_IN, 0x88, t0 + 20 * SECOND));
      rec.take();

      b.tick(t0 + 29 * SECOND);
      assert!(rec.take().is_empty());
      assert_eq!(b.candidates().len(), 2);

      b.tick(t0 + 30 * SECOND);
      assert_eq!(rec.take(), [TrackerEvent::CandidatesChanged(1)]);
      let ranked = b.candidates();
      assert_eq!(ranked.len(), 1);
      assert_eq!(ranked[0].fingerprint, fp(0x01));

      b.tick(t0 + 50 * SECOND);
      assert_eq!(rec.take(), [TrackerEvent::CandidatesChanged(0)]);
      assert!(b.candidates().is_empty());
   }
}
