//! Adapter lookup and one-shot scanning

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use gatekeep_session::TransportError;
use std::time::Duration;
use uuid::Uuid;

/// A peripheral seen during [`scan`]
#[derive(Debug, Clone)]
pub struct NearbyDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

pub(crate) fn backend(e: btleplug::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

/// Parse a GATT id, short ("180A") or full, into a uuid
pub(crate) fn parse_gatt_uuid(id: &str) -> Result<Uuid, TransportError> {
    Uuid::parse_str(&gatekeep_proto::normalize_gatt_id(id))
        .map_err(|e| TransportError::Backend(format!("invalid GATT id {id:?}: {e}")))
}

/// Does `uuid` name the same attribute as the configured `id`
pub(crate) fn gatt_matches(uuid: &Uuid, id: &str) -> bool {
    gatekeep_proto::gatt_id_eq(&uuid.to_string(), id)
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(backend)?;
    let adapters = manager.adapters().await.map_err(backend)?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// Scan for `duration` and list every named peripheral that was seen
pub async fn scan(duration: Duration) -> Result<Vec<NearbyDevice>, TransportError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await.map_err(backend)?;
    tokio::time::sleep(duration).await;

    let peripherals = adapter.peripherals().await.map_err(backend)?;
    let mut devices = Vec::new();

    for peripheral in peripherals {
        if let Some(props) = peripheral.properties().await.map_err(backend)? {
            let name = props.local_name.unwrap_or_else(|| "Unknown".to_string());
            let address = peripheral.address().to_string();
            devices.push(NearbyDevice { name, address, rssi: props.rssi });
        }
    }

    adapter.stop_scan().await.map_err(backend)?;
    Ok(devices)
}
