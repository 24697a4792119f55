//! Payload decoding for proximity-pairing advertisements.
//!
//! This module turns the fixed-layout manufacturer payload into a
//! [`DecodedStatus`]. Decoding is a pure transform: the same bytes always
//! produce the same status.

use log::trace;
use thiserror::Error;

use crate::airpods::{
   filter::Payload,
   protocol::{
      Battery, CaseStatus, DecodedStatus, FLAG_BOTH_IN_CASE, FLAG_BROADCAST_LEFT,
      FLAG_CASE_CHARGING, FLAG_CURR_CHARGING, FLAG_CURR_IN_EAR, FLAG_OTHER_CHARGING,
      FLAG_OTHER_IN_EAR, LID_CLOSED_MIN, Model, OFF_CASE_BATTERY, OFF_COLOR, OFF_ENCRYPTED,
      OFF_FLAGS, OFF_LENGTH, OFF_LID, OFF_MODEL, OFF_POD_BATTERY, OFF_PREFIX, OFF_TYPE, PP_LEN,
      PP_REMAINING_LEN, PP_TYPE, PodStatus, Side,
   },
};

/// Why a payload failed structural checks.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
   #[error("expected {expected} bytes, got {actual}")]
   SizeMismatch { expected: usize, actual: usize },

   #[error("declared remaining length {declared}, expected {expected}")]
   LengthField { declared: u8, expected: u8 },

   #[error("message type 0x{found:02x} is not proximity pairing")]
   MessageType { found: u8 },
}

/// Error type for protocol parsing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
   /// Frame failed length or structure checks
   #[error("Malformed payload: {0}")]
   MalformedPayload(MalformedReason),
}

impl From<MalformedReason> for ProtoError {
   fn from(reason: MalformedReason) -> Self {
      Self::MalformedPayload(reason)
   }
}

/// Parses a proximity-pairing manufacturer payload.
///
/// Battery nibbles on the 0..=10 scale map to whole percent; any other nibble
/// value is reported as [`Battery::Unknown`]. Unrecognized model identifiers
/// decode to [`Model::Unknown`] and reserved flag bits are ignored.
pub fn parse_proximity_pairing(data: &[u8]) -> Result<DecodedStatus, ProtoError> {
   if data.len() != PP_LEN {
      return Err(
         MalformedReason::SizeMismatch {
            expected: PP_LEN,
            actual: data.len(),
         }
         .into(),
      );
   }
   if data[OFF_TYPE] != PP_TYPE {
      return Err(
         MalformedReason::MessageType {
            found: data[OFF_TYPE],
         }
         .into(),
      );
   }
   if data[OFF_LENGTH] != PP_REMAINING_LEN {
      return Err(
         MalformedReason::LengthField {
            declared: data[OFF_LENGTH],
            expected: PP_REMAINING_LEN,
         }
         .into(),
      );
   }

   let model_id = u16::from_le_bytes([data[OFF_MODEL], data[OFF_MODEL + 1]]);
   let model = Model::from_id(model_id);

   let flags = data[OFF_FLAGS];
   let side = if flags & FLAG_BROADCAST_LEFT != 0 {
      Side::Left
   } else {
      Side::Right
   };

   let pods = data[OFF_POD_BATTERY];
   let case = data[OFF_CASE_BATTERY];

   // A pod sitting on its charger can still report the in-ear bit.
   let pod = |battery: u8, charging_bit: u8, in_ear_bit: u8| {
      let charging = case & charging_bit != 0;
      PodStatus {
         battery: Battery::from_nibble(battery),
         charging,
         in_ear: !charging && flags & in_ear_bit != 0,
      }
   };
   let current = pod(pods & 0x0f, FLAG_CURR_CHARGING, FLAG_CURR_IN_EAR);
   let other = pod(pods >> 4, FLAG_OTHER_CHARGING, FLAG_OTHER_IN_EAR);

   let (left, right) = match side {
      Side::Left => (current, other),
      Side::Right => (other, current),
   };

   let status = DecodedStatus {
      prefix: data[OFF_PREFIX],
      model_id,
      model,
      color: data[OFF_COLOR],
      side,
      layout: model.layout(),
      left,
      right,
      case: CaseStatus {
         battery: Battery::from_nibble(case & 0x0f),
         charging: case & FLAG_CASE_CHARGING != 0,
         lid_open: data[OFF_LID] < LID_CLOSED_MIN,
         both_in_case: flags & FLAG_BOTH_IN_CASE != 0,
      },
   };
   trace!("Decoded proximity pairing: {status:?}");
   Ok(status)
}

/// Returns a copy of the payload with the encrypted region zeroed, suitable
/// for logging.
pub fn desensitize(data: &[u8]) -> Payload {
   let mut out = Payload::from_slice(data);
   if out.len() > OFF_ENCRYPTED {
      out[OFF_ENCRYPTED..].fill(0);
   }
   out
}
