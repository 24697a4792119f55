//! Address-independent device identity.
//!
//! `AirPods` advertise from random non-resolvable addresses that rotate every
//! few minutes, so the address cannot be used to remember a device. The
//! fingerprint is derived instead from the payload bytes that stay constant
//! across successive advertisements of the same physical unit.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, ToSmolStr};

use crate::{
   airpods::protocol::DecodedStatus,
   error::{Result, TrackerError},
};

/// Stable identity hint: prefix byte, model identifier and color code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "SmolStr", try_from = "SmolStr")]
pub struct Fingerprint([u8; 4]);

impl Fingerprint {
   pub const fn of(status: &DecodedStatus) -> Self {
      let [lo, hi] = status.model_id.to_le_bytes();
      Self([status.prefix, lo, hi, status.color])
   }

   pub const fn from_bytes(bytes: [u8; 4]) -> Self {
      Self(bytes)
   }

   pub const fn model_id(self) -> u16 {
      u16::from_le_bytes([self.0[1], self.0[2]])
   }
}

impl fmt::Display for Fingerprint {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&hex::encode(self.0))
   }
}

impl FromStr for Fingerprint {
   type Err = TrackerError;

   fn from_str(s: &str) -> Result<Self> {
      let mut bytes = [0u8; 4];
      hex::decode_to_slice(s.trim(), &mut bytes)
         .map_err(|e| TrackerError::InvalidFingerprint(format!("{s:?}: {e}").into()))?;
      Ok(Self::from_bytes(bytes))
   }
}

impl From<Fingerprint> for SmolStr {
   fn from(fp: Fingerprint) -> Self {
      fp.to_smolstr()
   }
}

impl TryFrom<SmolStr> for Fingerprint {
   type Error = TrackerError;

   fn try_from(s: SmolStr) -> Result<Self> {
      s.parse()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::parser::{parse_proximity_pairing, tests::frame};

   #[test]
   fn test_fingerprint_ignores_volatile_fields() {
      // Same unit, different side, battery, flags and lid counter
      let a = parse_proximity_pairing(&frame(0x2014, 0x22, 0x98, 0x05, 0x01, 0x00)).unwrap();
      let b = parse_proximity_pairing(&frame(0x2014, 0x0a, 0x79, 0x45, 0x0c, 0x00)).unwrap();
      assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
   }

   #[test]
   fn test_fingerprint_distinguishes_model_and_color() {
      let white = parse_proximity_pairing(&frame(0x2014, 0, 0x55, 0x05, 0, 0x00)).unwrap();
      let black = parse_proximity_pairing(&frame(0x2014, 0, 0x55, 0x05, 0, 0x01)).unwrap();
      let other = parse_proximity_pairing(&frame(0x200F, 0, 0x55, 0x05, 0, 0x00)).unwrap();
      assert_ne!(Fingerprint::of(&white), Fingerprint::of(&black));
      assert_ne!(Fingerprint::of(&white), Fingerprint::of(&other));
   }

   #[test]
   fn test_fingerprint_string_form() {
      let fp = Fingerprint::from_bytes([0x01, 0x14, 0x20, 0x00]);
      assert_eq!(fp.to_string(), "01142000");
      assert_eq!(fp.model_id(), 0x2014);
      assert_eq!("01142000".parse::<Fingerprint>().unwrap(), fp);
      assert!("0114".parse::<Fingerprint>().is_err());
      assert!("zz142000".parse::<Fingerprint>().is_err());
   }
}
