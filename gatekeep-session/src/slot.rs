//! Peripheral slots - one per named role ("door", "user")

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Opaque identifier of a peripheral, as handed out by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralHandle(String);

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No peripheral held, waiting for a matching discovery
    #[default]
    Disconnected,
    /// Connect request issued
    Connecting,
    /// Link up, service discovery in progress
    Connected,
    /// Target characteristic confirmed, reads and writes allowed
    ServiceReady,
}

/// Static configuration of a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub role: String,
    pub advertised_name: String,
    pub service_id: String,
    pub characteristic_id: String,
}

impl SlotConfig {
    pub fn new(
        role: impl Into<String>,
        advertised_name: impl Into<String>,
        service_id: impl Into<String>,
        characteristic_id: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            advertised_name: advertised_name.into(),
            service_id: service_id.into(),
            characteristic_id: characteristic_id.into(),
        }
    }
}

/// Live state of one slot, owned by the session state machine
#[derive(Debug, Clone)]
pub struct PeripheralSlot {
    pub config: SlotConfig,
    state: ConnectionState,
    handle: Option<PeripheralHandle>,
    last_value: Option<u8>,
    since: Option<Instant>,
    read_in_flight: bool,
    // bumped on every claim, so results from an earlier link are told apart
    // even when the transport reuses the handle
    epoch: u64,
}

impl PeripheralSlot {
    pub fn new(config: SlotConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            handle: None,
            last_value: None,
            since: None,
            read_in_flight: false,
            epoch: 0,
        }
    }

    pub fn role(&self) -> &str {
        &self.config.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> Option<&PeripheralHandle> {
        self.handle.as_ref()
    }

    pub fn last_value(&self) -> Option<u8> {
        self.last_value
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::ServiceReady
    }

    /// True if this slot currently holds `handle`
    pub fn holds(&self, handle: &PeripheralHandle) -> bool {
        self.handle.as_ref() == Some(handle)
    }

    /// Connection epoch of the current (or last) link
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// True if `handle` at `epoch` is the link this slot holds right now
    pub fn is_link(&self, handle: &PeripheralHandle, epoch: u64) -> bool {
        self.holds(handle) && self.epoch == epoch
    }

    /// `handle` is present iff the slot is not `Disconnected`
    pub fn is_consistent(&self) -> bool {
        self.handle.is_some() == (self.state != ConnectionState::Disconnected)
    }

    pub(crate) fn since(&self) -> Option<Instant> {
        self.since
    }

    pub(crate) fn read_in_flight(&self) -> bool {
        self.read_in_flight
    }

    pub(crate) fn set_read_in_flight(&mut self, in_flight: bool) {
        self.read_in_flight = in_flight;
    }

    pub(crate) fn set_last_value(&mut self, value: u8) {
        self.last_value = Some(value);
    }

    /// Claim a discovered peripheral and start connecting
    pub(crate) fn begin_connect(&mut self, handle: PeripheralHandle, now: Instant) {
        self.state = ConnectionState::Connecting;
        self.handle = Some(handle);
        self.epoch += 1;
        self.since = Some(now);
        self.read_in_flight = false;
        debug_assert!(self.is_consistent());
    }

    pub(crate) fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        debug_assert!(self.is_consistent());
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = ConnectionState::ServiceReady;
        self.since = None;
        debug_assert!(self.is_consistent());
    }

    /// Drop the peripheral and go back to `Disconnected`, returning the handle held
    pub(crate) fn reset(&mut self) -> Option<PeripheralHandle> {
        self.state = ConnectionState::Disconnected;
        self.since = None;
        self.read_in_flight = false;
        let handle = self.handle.take();
        debug_assert!(self.is_consistent());
        handle
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            role: self.config.role.clone(),
            state: self.state,
            last_value: self.last_value,
        }
    }
}

/// What the presentation layer gets to see of a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub role: String,
    pub state: ConnectionState,
    pub last_value: Option<u8>,
}
