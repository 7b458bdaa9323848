//! BLE GATT constants for the door and user components
//!
//! Both components expose one readable/writable characteristic holding a
//! single byte: 0 when the door is locked, 1 when it is unlocked.

/// Default GATT service id (Device Information, 16-bit short form)
pub const DEFAULT_SERVICE_ID: &str = "180A";

/// Default lock characteristic id (16-bit short form)
pub const DEFAULT_CHARACTERISTIC_ID: &str = "2A57";

/// Advertised local name of the reference door component
pub const DEFAULT_DOOR_NAME: &str = "Nano 33 IoT - Chirag";

/// Suffix of the Bluetooth base UUID used to expand 16/32-bit short ids
const BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Lock command bytes written to the lock characteristic
pub mod commands {
    /// Lock the door
    pub const LOCK: u8 = 0x00;

    /// Unlock the door
    pub const UNLOCK: u8 = 0x01;
}

/// Lock state as reported by the lock characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
    Unknown,
}

impl LockState {
    /// Decode the last value read from a component (`None` = nothing read yet)
    pub fn from_value(value: Option<u8>) -> Self {
        match value {
            Some(commands::LOCK) => LockState::Locked,
            Some(commands::UNLOCK) => LockState::Unlocked,
            _ => LockState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Locked => "Locked",
            LockState::Unlocked => "Unlocked",
            LockState::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a GATT id to its full lowercase 128-bit form
///
/// 4 and 8 hex digit short forms ("180A", "00002a57") are expanded against
/// the Bluetooth base UUID. Anything else is only lowercased.
pub fn normalize_gatt_id(id: &str) -> String {
    let id = id.trim().to_ascii_lowercase();
    let is_hex = !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit());

    match id.len() {
        4 if is_hex => format!("0000{id}{BASE_UUID_SUFFIX}"),
        8 if is_hex => format!("{id}{BASE_UUID_SUFFIX}"),
        _ => id,
    }
}

/// Compare two GATT ids case-insensitively, accepting short forms on either side
pub fn gatt_id_eq(a: &str, b: &str) -> bool {
    normalize_gatt_id(a) == normalize_gatt_id(b)
}
