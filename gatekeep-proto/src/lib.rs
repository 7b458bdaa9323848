//! Gatekeep protocol constants
//!
//! Shared between the session core, the btleplug transport and the CLI.

pub mod ble;

pub use ble::{LockState, commands, gatt_id_eq, normalize_gatt_id};
