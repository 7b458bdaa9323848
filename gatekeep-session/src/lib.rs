//! Gatekeep session core
//!
//! Keeps one BLE connection per configured role (door, user) alive: scans for
//! the peripheral's advertised name, connects, checks it offers the expected
//! characteristic, then polls its value and forwards lock/unlock writes. The
//! radio sits behind [`BleTransport`]; [`SessionState`] holds all lifecycle
//! rules and [`Session`] runs them on a tokio task.
//!
//! [`Authenticator`] guards the whole thing with the password stored next to
//! the GATT ids in the config file.

mod auth;
pub mod config;
mod error;
mod machine;
mod session;
mod slot;
mod transport;

pub use auth::{AuthState, Authenticator};
pub use config::{GattIds, SessionConfig, SessionOptions};
pub use error::{AuthError, ConfigError, SessionError};
pub use machine::{Action, Completion, SessionState};
pub use session::{Session, SessionHandle};
pub use slot::{ConnectionState, PeripheralHandle, PeripheralSlot, SlotConfig, SlotSnapshot};
pub use transport::{BleTransport, GattCharacteristic, TransportError, TransportEvent};
