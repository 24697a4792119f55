//! Bluetooth layer for the tracker.
//!
//! This module provides BlueZ LE discovery and the manager actor that feeds
//! discovered advertisements into the binding state machine.

pub mod manager;
pub mod scanner;
