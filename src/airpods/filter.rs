//! Advertisement filtering for proximity-pairing frames.
//!
//! Nearby phones, watches and laptops broadcast Apple manufacturer data of
//! many different message types. Only the proximity-pairing frames sent by
//! earbuds are of interest; everything else is expected background noise and
//! is counted rather than reported.

use std::time::Instant;

use bluer::Address;
use log::trace;
use serde::Serialize;
use smallvec::SmallVec;

use crate::airpods::protocol::{APPLE_CID, OFF_TYPE, PP_LEN, PP_TYPE};

pub type Payload = SmallVec<[u8; 32]>;

/// A single manufacturer-data advertisement as delivered by the scanner.
#[derive(Debug, Clone)]
pub struct RawAdvertisement {
   pub address: Address,
   pub rssi: Option<i16>,
   pub company_id: u16,
   pub payload: Payload,
   pub timestamp: Instant,
}

impl RawAdvertisement {
   pub fn new(
      address: Address,
      rssi: Option<i16>,
      company_id: u16,
      payload: &[u8],
      timestamp: Instant,
   ) -> Self {
      Self {
         address,
         rssi,
         company_id,
         payload: Payload::from_slice(payload),
         timestamp,
      }
   }
}

/// Outcome of filtering one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Verdict {
   Accept,
   ForeignVendor,
   WrongType,
   TooShort,
}

impl Verdict {
   pub const fn is_accept(self) -> bool {
      matches!(self, Self::Accept)
   }
}

/// Per-reason counters of filtered advertisements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterStats {
   pub accepted: u64,
   pub foreign_vendor: u64,
   pub wrong_type: u64,
   pub too_short: u64,
}

/// Classifies an advertisement without counting it.
pub fn classify(adv: &RawAdvertisement) -> Verdict {
   if adv.company_id != APPLE_CID {
      Verdict::ForeignVendor
   } else if adv.payload.get(OFF_TYPE) != Some(&PP_TYPE) {
      Verdict::WrongType
   } else if adv.payload.len() < PP_LEN {
      Verdict::TooShort
   } else {
      Verdict::Accept
   }
}

/// Stateful filter that counts rejections by reason.
#[derive(Debug, Default)]
pub struct AdvertisementFilter {
   stats: FilterStats,
}

impl AdvertisementFilter {
   pub fn new() -> Self {
      Self::default()
   }

   /// Returns true if the advertisement is a proximity-pairing frame.
   pub fn accept(&mut self, adv: &RawAdvertisement) -> bool {
      let verdict = classify(adv);
      match verdict {
         Verdict::Accept => self.stats.accepted += 1,
         Verdict::ForeignVendor => self.stats.foreign_vendor += 1,
         Verdict::WrongType => self.stats.wrong_type += 1,
         Verdict::TooShort => self.stats.too_short += 1,
      }
      if !verdict.is_accept() {
         trace!(
            "{}: dropped advertisement (cid=0x{:04x}, {} bytes): {verdict}",
            adv.address,
            adv.company_id,
            adv.payload.len()
         );
      }
      verdict.is_accept()
   }

   pub const fn stats(&self) -> FilterStats {
      self.stats
   }
}
