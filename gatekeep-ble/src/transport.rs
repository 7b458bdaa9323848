//! `BleTransport` over btleplug

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::StreamExt;
use gatekeep_session::{
    BleTransport, GattCharacteristic, PeripheralHandle, TransportError, TransportEvent,
};
use log::{debug, trace, warn};
use tokio::sync::mpsc;

use crate::ble::{backend, gatt_matches, get_adapter, parse_gatt_uuid};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn handle_for(id: &PeripheralId) -> PeripheralHandle {
    PeripheralHandle::new(id.to_string())
}

/// Scan windows by generation; a window timer only fires for the latest one
#[derive(Default)]
struct ScanWindows {
    generation: AtomicU64,
}

impl ScanWindows {
    fn open(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

#[derive(Default)]
struct Shared {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    windows: ScanWindows,
    allow_duplicates: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl BtleplugTransport {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Use the first Bluetooth adapter of the system
    pub async fn with_default_adapter() -> Result<Self, TransportError> {
        Ok(Self::new(get_adapter().await?))
    }

    /// The adapter keeps every peripheral it has seen, so handles resolve against it
    async fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await
            .map_err(backend)?
            .into_iter()
            .find(|p| handle_for(&p.id()) == *handle)
            .ok_or_else(|| TransportError::UnknownPeripheral(handle.clone()))
    }

    async fn characteristic(
        &self,
        peripheral: &Peripheral,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Characteristic, TransportError> {
        if peripheral.characteristics().is_empty() {
            peripheral.discover_services().await.map_err(backend)?;
        }

        peripheral
            .characteristics()
            .into_iter()
            .find(|c| gatt_matches(&c.service_uuid, service_id) && gatt_matches(&c.uuid, characteristic_id))
            .ok_or_else(|| TransportError::CharacteristicNotFound {
                service: service_id.to_string(),
                characteristic: characteristic_id.to_string(),
            })
    }
}

/// Look up the advertised name of a freshly seen peripheral
async fn discovered(adapter: &Adapter, id: PeripheralId) -> Option<TransportEvent> {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            debug!("peripheral {id:?} vanished: {e}");
            return None;
        }
    };

    let name = match peripheral.properties().await {
        Ok(Some(props)) => props.local_name?,
        Ok(None) => return None,
        Err(e) => {
            debug!("no properties for {id:?}: {e}");
            return None;
        }
    };

    trace!("saw {name:?} ({id:?})");
    Some(TransportEvent::PeripheralDiscovered {
        handle: handle_for(&id),
        advertised_name: name,
    })
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let mut central_events = self.adapter.events().await.map_err(backend)?;
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.shared.events) = Some(tx.clone());

        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let event = match event {
                    CentralEvent::DeviceDiscovered(id) => discovered(&adapter, id).await,
                    CentralEvent::DeviceUpdated(id)
                        if shared.allow_duplicates.load(Ordering::Relaxed) =>
                    {
                        discovered(&adapter, id).await
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        Some(TransportEvent::PeripheralDisconnected { handle: handle_for(&id) })
                    }
                    _ => None,
                };

                if let Some(event) = event {
                    if tx.send(event).is_err() {
                        debug!("event receiver dropped, stopping adapter event pump");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn scan(
        &self,
        service_filter: &[String],
        timeout: Duration,
        allow_duplicates: bool,
    ) -> Result<(), TransportError> {
        let services = service_filter
            .iter()
            .map(|id| parse_gatt_uuid(id))
            .collect::<Result<Vec<_>, _>>()?;

        self.shared.allow_duplicates.store(allow_duplicates, Ordering::Relaxed);
        self.adapter
            .start_scan(ScanFilter { services })
            .await
            .map_err(backend)?;

        let generation = self.shared.windows.open();
        let adapter = self.adapter.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !shared.windows.is_current(generation) {
                // a newer scan owns the window now
                return;
            }
            if let Err(e) = adapter.stop_scan().await {
                warn!("stop_scan failed: {e}");
            }
            shared.emit(TransportEvent::ScanStopped);
        });

        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle).await?;
        peripheral.connect().await.map_err(backend)
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle).await?;
        if !peripheral.is_connected().await.map_err(backend)? {
            return Ok(());
        }
        peripheral.disconnect().await.map_err(backend)
    }

    async fn discover_services(
        &self,
        handle: &PeripheralHandle,
    ) -> Result<Vec<GattCharacteristic>, TransportError> {
        let peripheral = self.peripheral(handle).await?;
        peripheral.discover_services().await.map_err(backend)?;

        Ok(peripheral
            .characteristics()
            .iter()
            .map(|c| GattCharacteristic::new(c.service_uuid.to_string(), c.uuid.to_string()))
            .collect())
    }

    async fn read(
        &self,
        handle: &PeripheralHandle,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.peripheral(handle).await?;
        let characteristic = self.characteristic(&peripheral, service_id, characteristic_id).await?;
        peripheral.read(&characteristic).await.map_err(backend)
    }

    async fn write(
        &self,
        handle: &PeripheralHandle,
        service_id: &str,
        characteristic_id: &str,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle).await?;
        let characteristic = self.characteristic(&peripheral, service_id, characteristic_id).await?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(backend)
    }
}
