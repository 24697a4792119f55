//! Proximity-pairing protocol definitions and data structures.
//!
//! This module contains the constants describing the fixed layout of the
//! Apple Continuity "proximity pairing" manufacturer payload broadcast by
//! `AirPods`, and the decoded status types produced from it.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Apple company ID for manufacturer data
pub const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type
pub const PP_TYPE: u8 = 0x07;

/// Total length of a proximity-pairing payload, including the 2-byte header
pub const PP_LEN: usize = 27;

/// Value of the remaining-length header byte
pub const PP_REMAINING_LEN: u8 = (PP_LEN - 2) as u8;

// Field offsets inside the manufacturer payload
pub const OFF_TYPE: usize = 0;
pub const OFF_LENGTH: usize = 1;
pub const OFF_PREFIX: usize = 2;
pub const OFF_MODEL: usize = 3;
pub const OFF_FLAGS: usize = 5;
pub const OFF_POD_BATTERY: usize = 6;
pub const OFF_CASE_BATTERY: usize = 7;
pub const OFF_LID: usize = 8;
pub const OFF_COLOR: usize = 9;
pub const OFF_ENCRYPTED: usize = 11;

// Status flag bits (offset 5)
pub const FLAG_CURR_IN_EAR: u8 = 1 << 1;
pub const FLAG_BOTH_IN_CASE: u8 = 1 << 2;
pub const FLAG_OTHER_IN_EAR: u8 = 1 << 3;
pub const FLAG_BROADCAST_LEFT: u8 = 1 << 5;

// Charging bits (offset 7, high nibble)
pub const FLAG_CURR_CHARGING: u8 = 1 << 4;
pub const FLAG_OTHER_CHARGING: u8 = 1 << 5;
pub const FLAG_CASE_CHARGING: u8 = 1 << 6;

/// Lid byte values below this are "open"; the counter wraps into 0x08.. when closed.
pub const LID_CLOSED_MIN: u8 = 0x08;

/// Battery nibble that means 100%; anything above is "not reported".
pub const BATTERY_NIBBLE_FULL: u8 = 10;

/// Known `AirPods`/Beats models.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum Model {
   #[strum(serialize = "AirPods 1")]
   AirPods1,
   #[strum(serialize = "AirPods 2")]
   AirPods2,
   #[strum(serialize = "AirPods 3")]
   AirPods3,
   #[strum(serialize = "AirPods Pro")]
   AirPodsPro,
   #[strum(serialize = "AirPods Pro 2")]
   AirPodsPro2,
   #[strum(serialize = "AirPods Max")]
   AirPodsMax,
   #[strum(serialize = "Powerbeats 3")]
   Powerbeats3,
   #[strum(serialize = "Powerbeats Pro")]
   PowerbeatsPro,
   #[strum(serialize = "BeatsX")]
   BeatsX,
   #[strum(serialize = "Beats Solo3")]
   BeatsSolo3,
   #[strum(serialize = "Unknown")]
   Unknown,
}

impl Model {
   /// Maps the 2-byte model identifier; unrecognized ids degrade to `Unknown`.
   pub const fn from_id(id: u16) -> Self {
      match id {
         0x2002 => Self::AirPods1,
         0x200F => Self::AirPods2,
         0x2013 => Self::AirPods3,
         0x200E | 0x2014 => Self::AirPodsPro,
         0x2024 => Self::AirPodsPro2,
         0x200A => Self::AirPodsMax,
         0x2003 => Self::Powerbeats3,
         0x2012 => Self::PowerbeatsPro,
         0x2005 => Self::BeatsX,
         0x2006 => Self::BeatsSolo3,
         _ => Self::Unknown,
      }
   }

   pub const fn is_known(self) -> bool {
      !matches!(self, Self::Unknown)
   }

   pub const fn layout(self) -> PodLayout {
      match self {
         Self::AirPodsMax | Self::BeatsSolo3 => PodLayout::Single,
         _ => PodLayout::Dual,
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Whether the product has two independent earbuds or a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PodLayout {
   Single,
   Dual,
}

/// Which earbud transmitted an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Side {
   Left,
   Right,
}

impl Side {
   pub const fn other(self) -> Self {
      match self {
         Self::Left => Self::Right,
         Self::Right => Self::Left,
      }
   }
}

/// Case/earbud colors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Color {
   White = 0x0,
   Black = 0x1,
   Red = 0x2,
   Blue = 0x3,
   Pink = 0x4,
   Gray = 0x5,
   Silver = 0x6,
   Gold = 0x7,
   RoseGold = 0x8,
   SpaceGray = 0x9,
   DarkBlue = 0xA,
   LightBlue = 0xB,
   Yellow = 0xC,
}

/// Battery level of a single unit, in whole percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Battery {
   #[default]
   Unknown,
   Level(u8),
}

impl Battery {
   /// Decodes a 4-bit battery nibble on the 0..=10 scale.
   pub const fn from_nibble(nibble: u8) -> Self {
      let nibble = nibble & 0x0f;
      if nibble <= BATTERY_NIBBLE_FULL {
         Self::Level(nibble * 10)
      } else {
         Self::Unknown
      }
   }

   pub const fn level(self) -> Option<u8> {
      match self {
         Self::Level(l) => Some(l),
         Self::Unknown => None,
      }
   }

   pub const fn is_known(self) -> bool {
      matches!(self, Self::Level(_))
   }
}

/// Status of one earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodStatus {
   pub battery: Battery,
   pub charging: bool,
   pub in_ear: bool,
}

impl PodStatus {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "battery": self.battery.level(),
          "charging": self.charging,
          "in_ear": self.in_ear,
      })
   }
}

/// Status of the charging case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CaseStatus {
   pub battery: Battery,
   pub charging: bool,
   pub lid_open: bool,
   pub both_in_case: bool,
}

impl CaseStatus {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "battery": self.battery.level(),
          "charging": self.charging,
          "lid_open": self.lid_open,
          "both_in_case": self.both_in_case,
      })
   }
}

/// Structured status decoded from one proximity-pairing advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedStatus {
   pub prefix: u8,
   pub model_id: u16,
   pub model: Model,
   pub color: u8,
   pub side: Side,
   pub layout: PodLayout,
   pub left: PodStatus,
   pub right: PodStatus,
   pub case: CaseStatus,
}

impl DecodedStatus {
   pub fn color_name(&self) -> String {
      Color::from_repr(self.color).map_or_else(|| format!("0x{:02x}", self.color), |c| c.to_string())
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "model": self.model.to_str(),
          "model_id": format!("0x{:04x}", self.model_id),
          "color": self.color_name(),
          "layout": self.layout.to_string(),
          "left": self.left.to_json(),
          "right": self.right.to_json(),
          "case": self.case.to_json(),
      })
   }
}
