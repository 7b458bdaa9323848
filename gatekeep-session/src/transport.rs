//! BLE transport capability consumed by the session

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::PeripheralHandle;

/// Event pushed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PeripheralDiscovered {
        handle: PeripheralHandle,
        advertised_name: String,
    },
    PeripheralDisconnected {
        handle: PeripheralHandle,
    },
    ScanStopped,
}

/// A (service, characteristic) pair found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub service: String,
    pub characteristic: String,
}

impl GattCharacteristic {
    pub fn new(service: impl Into<String>, characteristic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            characteristic: characteristic.into(),
        }
    }

    /// Case-insensitive match, short ids accepted on either side
    pub fn matches(&self, service_id: &str, characteristic_id: &str) -> bool {
        gatekeep_proto::gatt_id_eq(&self.service, service_id)
            && gatekeep_proto::gatt_id_eq(&self.characteristic, characteristic_id)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralHandle),
    #[error("characteristic {service}/{characteristic} not found")]
    CharacteristicNotFound {
        service: String,
        characteristic: String,
    },
    #[error("bluetooth error: {0}")]
    Backend(String),
}

/// Scan, connect and characteristic I/O
///
/// Implementations must be cheap to share: the session calls them from
/// spawned tasks through an `Arc`.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Open the event stream; dropping the receiver unsubscribes
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError>;

    /// Scan for `timeout`, then emit `ScanStopped`
    async fn scan(
        &self,
        service_filter: &[String],
        timeout: Duration,
        allow_duplicates: bool,
    ) -> Result<(), TransportError>;

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    async fn discover_services(
        &self,
        handle: &PeripheralHandle,
    ) -> Result<Vec<GattCharacteristic>, TransportError>;

    async fn read(
        &self,
        handle: &PeripheralHandle,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        handle: &PeripheralHandle,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> Result<(), TransportError>;
}

// ============================================================================
// Mock transport (for testing)
// ============================================================================
