//! Gatekeep BLE
//!
//! btleplug-backed [`BleTransport`](gatekeep_session::BleTransport) plus a
//! one-shot scan helper.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gatekeep_ble::BtleplugTransport;
//! use gatekeep_session::{Session, SessionOptions, SlotConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::with_default_adapter().await?);
//!     let door = SlotConfig::new("door", "Nano 33 IoT - Chirag", "180A", "2A57");
//!     let (session, _task) = Session::spawn(transport, vec![door], SessionOptions::default()).await?;
//!     session.write("door", 1).await?;
//!     Ok(())
//! }
//! ```

pub mod ble;
mod transport;

pub use ble::{NearbyDevice, get_adapter, scan};
pub use transport::BtleplugTransport;
