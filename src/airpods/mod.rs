//! `AirPods` advertisement decoding and device binding.
//!
//! This module contains the proximity-pairing protocol definitions, the
//! advertisement filter and decoder, identity matching, smoothing and the
//! binding state machine built on top of them.

pub mod binding;
pub mod device;
pub mod filter;
pub mod fingerprint;
pub mod matcher;
pub mod parser;
pub mod protocol;
pub mod smoothing;
