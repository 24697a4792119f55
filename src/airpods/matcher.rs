//! Matching decoded advertisements to a logical device.
//!
//! Several people's earbuds of the same model may be in range, and each unit
//! rotates its address. The matcher decides whether a decoded status belongs
//! to the bound device, should be surfaced as a discovery candidate, or must
//! be ignored because it belongs to someone else.

use std::{
   collections::HashMap,
   time::{Duration, Instant},
};

use bluer::Address;
use log::{debug, warn};
use serde::Serialize;
use serde_json::json;

use crate::airpods::{
   fingerprint::Fingerprint,
   protocol::{Battery, DecodedStatus, Model, Side},
};

/// Maximum number of candidates returned by a ranking.
pub const MAX_CANDIDATES: usize = 16;

/// Largest plausible battery change between two frames, in percent.
const MAX_BATTERY_STEP: u8 = 10;

/// Largest plausible RSSI change between two frames of the same device.
const MAX_RSSI_JUMP: i16 = 50;

/// Candidates are ranked by smoothed RSSI.
const RSSI_ALPHA: f64 = 0.3;

/// A device seen while discovering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
   pub fingerprint: Fingerprint,
   pub model: Model,
   pub address: Address,
   pub rssi: Option<i16>,
   pub last_seen: Instant,
   pub status: DecodedStatus,
   smoothed_rssi: Option<f64>,
}

impl Candidate {
   fn new(status: DecodedStatus, address: Address, rssi: Option<i16>, now: Instant) -> Self {
      Self {
         fingerprint: Fingerprint::of(&status),
         model: status.model,
         address,
         rssi,
         last_seen: now,
         status,
         smoothed_rssi: rssi.map(f64::from),
      }
   }

   fn refresh(&mut self, status: DecodedStatus, address: Address, rssi: Option<i16>, now: Instant) {
      self.model = status.model;
      self.address = address;
      self.status = status;
      self.last_seen = now;
      self.smoothed_rssi = match (self.smoothed_rssi, rssi) {
         (Some(prev), Some(new)) => Some(f64::from(new) * RSSI_ALPHA + prev * (1.0 - RSSI_ALPHA)),
         (prev, new) => new.map(f64::from).or(prev),
      };
      self.rssi = self.smoothed_rssi.map(|r| r.round() as i16);
   }

   fn rank_key(&self) -> f64 {
      self.smoothed_rssi.unwrap_or(f64::MIN)
   }

   pub fn to_json(&self, now: Instant) -> serde_json::Value {
      json!({
          "fingerprint": self.fingerprint.to_string(),
          "model": self.model.to_str(),
          "address": self.address.to_string(),
          "rssi": self.rssi,
          "last_seen_secs": now.saturating_duration_since(self.last_seen).as_secs(),
          "status": self.status.to_json(),
      })
   }
}

/// Outcome of matching one decoded advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
   /// Belongs to the bound device.
   Matched,
   /// Recorded as a discovery candidate; `new` if first seen.
   Candidate { new: bool },
   /// Fingerprint differs from the bound device.
   NoMatch,
   /// Fingerprint equal but the frame cannot plausibly come from the same unit.
   Implausible,
}

/// Counters kept by the matcher.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchStats {
   pub matched: u64,
   pub no_match: u64,
   pub implausible: u64,
   pub candidates_seen: u64,
}

/// Last accepted frame for one broadcasting side.
#[derive(Debug, Clone, Copy)]
struct SideTrack {
   address: Address,
   rssi: Option<i16>,
   status: DecodedStatus,
}

#[derive(Debug, Default)]
pub struct DeviceMatcher {
   candidates: HashMap<Fingerprint, Candidate>,
   tracks: [Option<SideTrack>; 2],
   stats: MatchStats,
}

const fn track_index(side: Side) -> usize {
   match side {
      Side::Left => 0,
      Side::Right => 1,
   }
}

fn battery_jump(new: Battery, old: Battery) -> u8 {
   match (new, old) {
      (Battery::Level(n), Battery::Level(o)) => n.abs_diff(o),
      _ => 0,
   }
}

fn rssi_jump(new: Option<i16>, old: Option<i16>) -> i16 {
   match (new, old) {
      (Some(n), Some(o)) => n.saturating_sub(o).saturating_abs(),
      _ => 0,
   }
}

impl DeviceMatcher {
   pub fn new() -> Self {
      Self::default()
   }

   pub const fn stats(&self) -> MatchStats {
      self.stats
   }

   /// Matches a frame against the bound fingerprint. Equality is exact.
   pub fn match_bound(
      &mut self,
      bound: Fingerprint,
      address: Address,
      rssi: Option<i16>,
      status: &DecodedStatus,
   ) -> MatchOutcome {
      let fp = Fingerprint::of(status);
      if fp != bound {
         self.stats.no_match += 1;
         return MatchOutcome::NoMatch;
      }
      if let Some(reason) = self.implausibility(address, rssi, status) {
         warn!("{address}: frame matches {fp} but is rejected: {reason}");
         self.stats.implausible += 1;
         return MatchOutcome::Implausible;
      }
      self.tracks[track_index(status.side)] = Some(SideTrack {
         address,
         rssi,
         status: *status,
      });
      self.stats.matched += 1;
      MatchOutcome::Matched
   }

   /// Checks a same-fingerprint frame against the last frames of the bound
   /// device. Only called once the fingerprint matched.
   fn implausibility(
      &self,
      address: Address,
      rssi: Option<i16>,
      status: &DecodedStatus,
   ) -> Option<String> {
      if let Some(last) = &self.tracks[track_index(status.side)]
         && last.address != address
      {
         let jumps = [
            battery_jump(status.left.battery, last.status.left.battery),
            battery_jump(status.right.battery, last.status.right.battery),
            battery_jump(status.case.battery, last.status.case.battery),
         ];
         if jumps.iter().any(|&j| j > MAX_BATTERY_STEP) {
            return Some(format!(
               "battery jumped after address change (l={} r={} c={})",
               jumps[0], jumps[1], jumps[2]
            ));
         }
         let jump = rssi_jump(rssi, last.rssi);
         if jump > MAX_RSSI_JUMP {
            return Some(format!("rssi jumped by {jump} after address change"));
         }
         debug!("Address changed to {address}, but still plausibly the same device");
      }

      if let Some(other) = &self.tracks[track_index(status.side.other())] {
         let jump = rssi_jump(rssi, other.rssi);
         if jump > MAX_RSSI_JUMP {
            return Some(format!("rssi differs from the other side by {jump}"));
         }
      }
      None
   }

   /// Records a frame seen while discovering.
   pub fn observe_candidate(
      &mut self,
      address: Address,
      rssi: Option<i16>,
      status: &DecodedStatus,
      now: Instant,
   ) -> MatchOutcome {
      self.stats.candidates_seen += 1;
      let fp = Fingerprint::of(status);
      match self.candidates.get_mut(&fp) {
         Some(candidate) => {
            candidate.refresh(*status, address, rssi, now);
            MatchOutcome::Candidate { new: false }
         },
         None => {
            debug!("New candidate {fp} ({}) at {address}", status.model);
            self
               .candidates
               .insert(fp, Candidate::new(*status, address, rssi, now));
            MatchOutcome::Candidate { new: true }
         },
      }
   }

   pub fn candidate(&self, fp: Fingerprint) -> Option<&Candidate> {
      self.candidates.get(&fp)
   }

   pub fn candidate_count(&self) -> usize {
      self.candidates.len()
   }

   /// Candidates ordered by strongest RSSI, then most recently seen.
   pub fn ranked(&self) -> heapless::Vec<Candidate, MAX_CANDIDATES> {
      let mut all: Vec<&Candidate> = self.candidates.values().collect();
      all.sort_by(|a, b| {
         b.rank_key()
            .total_cmp(&a.rank_key())
            .then_with(|| b.last_seen.cmp(&a.last_seen))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
      });
      all.into_iter().take(MAX_CANDIDATES).copied().collect()
   }

   /// Removes candidates not seen within `ttl`. Returns how many were removed.
   pub fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
      let before = self.candidates.len();
      self
         .candidates
         .retain(|_, c| now.saturating_duration_since(c.last_seen) < ttl);
      before - self.candidates.len()
   }

   pub fn clear_candidates(&mut self) {
      self.candidates.clear();
   }

   /// Forgets per-side history, e.g. after the bound device was lost.
   pub fn clear_tracks(&mut self) {
      self.tracks = [None, None];
   }
}
