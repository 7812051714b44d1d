use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use super::backend::{BleBackend, BleLink, DiscoveredDevice, LinkEvent, ResourceSnapshot};
use crate::config::BleConfig;
use crate::error::ConnectError;
use crate::utils::normalize_uuid;

const POWERED_ON_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LINK_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Radio backend backed by `btleplug`.
pub struct BtleplugBackend {
    adapters: Vec<AdapterHandle>,
    listeners: Arc<AtomicUsize>,
    peripherals_seen: AtomicUsize,
}

struct AdapterHandle {
    adapter: Adapter,
    name: String,
}

impl BtleplugBackend {
    /// Creates the real BLE backend, enumerating adapters once.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform manager cannot be created or no
    /// adapters are present.
    pub async fn new() -> Result<Self, ConnectError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(ConnectError::NoAdapters);
        }

        let mut handles = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.adapter_info().await?;
            handles.push(AdapterHandle { adapter, name });
        }
        info!(adapter_count = handles.len(), "BLE adapters ready");

        Ok(Self {
            adapters: handles,
            listeners: Arc::new(AtomicUsize::new(0)),
            peripherals_seen: AtomicUsize::new(0),
        })
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<(Peripheral, Adapter), ConnectError> {
        for handle in &self.adapters {
            let peripherals = handle.adapter.peripherals().await?;
            for peripheral in peripherals {
                if peripheral.id().to_string() == device_id {
                    return Ok((peripheral, handle.adapter.clone()));
                }
            }
        }
        Err(ConnectError::ConnectFailed {
            device: device_id.to_string(),
            detail: "peripheral disappeared after scan".to_string(),
        })
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    #[instrument(skip(self), level = "debug")]
    async fn wait_powered_on(&self, deadline: Duration) -> Result<(), ConnectError> {
        let started = tokio::time::Instant::now();
        loop {
            let mut any_unknown = false;
            for handle in &self.adapters {
                match handle.adapter.adapter_state().await? {
                    CentralState::PoweredOn => return Ok(()),
                    CentralState::Unknown => any_unknown = true,
                    CentralState::PoweredOff => {}
                }
            }

            let waited = started.elapsed();
            if waited >= deadline {
                trace!(any_unknown, "adapter never reached powered-on");
                return Err(ConnectError::PoweredOff {
                    waited_ms: waited.as_millis() as u64,
                });
            }
            sleep(POWERED_ON_POLL_INTERVAL).await;
        }
    }

    async fn start_scan(&self) -> Result<(), ConnectError> {
        for handle in &self.adapters {
            handle.adapter.start_scan(ScanFilter::default()).await?;
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), ConnectError> {
        for handle in &self.adapters {
            if let Err(error) = handle.adapter.stop_scan().await {
                debug!(?error, adapter = %handle.name, "failed to stop adapter scan cleanly");
            }
        }
        Ok(())
    }

    async fn discovered(&self) -> Result<Vec<DiscoveredDevice>, ConnectError> {
        let mut devices = Vec::new();
        for handle in &self.adapters {
            let peripherals = handle.adapter.peripherals().await?;
            for peripheral in peripherals {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let service_uuids = properties
                    .services
                    .iter()
                    .filter_map(|uuid| normalize_uuid(&uuid.to_string()))
                    .collect();
                devices.push(DiscoveredDevice {
                    id: peripheral.id().to_string(),
                    local_name: properties.local_name,
                    rssi: properties.rssi,
                    service_uuids,
                });
            }
        }
        self.peripherals_seen.store(devices.len(), Ordering::Relaxed);
        Ok(devices)
    }

    #[instrument(skip(self, config), level = "debug", fields(device = device_id))]
    async fn connect(
        &self,
        device_id: &str,
        config: &BleConfig,
    ) -> Result<Box<dyn BleLink>, ConnectError> {
        let (peripheral, adapter) = self.find_peripheral(device_id).await?;

        if !peripheral.is_connected().await? {
            peripheral
                .connect()
                .await
                .map_err(|error| ConnectError::ConnectFailed {
                    device: device_id.to_string(),
                    detail: error.to_string(),
                })?;
        }
        peripheral.discover_services().await?;

        let device_name = peripheral
            .properties()
            .await?
            .and_then(|properties| properties.local_name);

        let (write_char, notify_char) = resolve_characteristics(&peripheral, config)?;
        info!(device = %device_id, name = ?device_name, "connected to peripheral");

        Ok(Box::new(BtleplugLink {
            peripheral,
            adapter,
            device_name,
            write_char,
            notify_char,
            listeners: Arc::clone(&self.listeners),
            pump: Mutex::new(None),
        }))
    }

    fn resource_snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            listener_count: self.listeners.load(Ordering::Relaxed),
            peripheral_count: self.peripherals_seen.load(Ordering::Relaxed),
        }
    }
}

/// Resolves the write and notify characteristics inside the configured
/// service, comparing normalized UUIDs on both sides.
fn resolve_characteristics(
    peripheral: &Peripheral,
    config: &BleConfig,
) -> Result<(Option<Characteristic>, Option<Characteristic>), ConnectError> {
    let mut service_found = false;
    let mut write_char = None;
    let mut notify_char = None;

    for service in peripheral.services() {
        let service_uuid = match normalize_uuid(&service.uuid.to_string()) {
            Some(uuid) => uuid,
            None => continue,
        };
        if service_uuid != config.service {
            continue;
        }
        service_found = true;

        for characteristic in &service.characteristics {
            let Some(uuid) = normalize_uuid(&characteristic.uuid.to_string()) else {
                continue;
            };
            if Some(&uuid) == config.write.as_ref() {
                write_char = Some(characteristic.clone());
            }
            if Some(&uuid) == config.notify.as_ref() {
                notify_char = Some(characteristic.clone());
            }
        }
    }

    let mut missing = Vec::new();
    if !service_found {
        missing.push(format!("service {}", config.service));
    }
    if config.write.is_some() && write_char.is_none() {
        missing.push(format!("write {}", config.write.as_deref().unwrap_or("")));
    }
    if config.notify.is_some() && notify_char.is_none() {
        missing.push(format!("notify {}", config.notify.as_deref().unwrap_or("")));
    }
    if !missing.is_empty() {
        return Err(ConnectError::CharacteristicsMissing {
            missing: missing.join(", "),
        });
    }

    Ok((write_char, notify_char))
}

struct PumpHandle {
    cancel: CancellationToken,
}

/// Active link bound to a real peripheral.
struct BtleplugLink {
    peripheral: Peripheral,
    adapter: Adapter,
    device_name: Option<String>,
    write_char: Option<Characteristic>,
    notify_char: Option<Characteristic>,
    listeners: Arc<AtomicUsize>,
    pump: Mutex<Option<PumpHandle>>,
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn device_name(&self) -> Option<String> {
        self.device_name.clone()
    }

    #[instrument(skip(self, payload), level = "trace", fields(payload_len = payload.len()))]
    async fn write(&self, payload: &[u8]) -> Result<(), ConnectError> {
        let Some(characteristic) = &self.write_char else {
            return Err(ConnectError::CharacteristicsMissing {
                missing: "write characteristic".to_string(),
            });
        };
        self.peripheral
            .write(characteristic, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkEvent>, ConnectError> {
        let notify_uuid = if let Some(characteristic) = &self.notify_char {
            self.peripheral
                .subscribe(characteristic)
                .await
                .map_err(|_| ConnectError::SubscribeFailed {
                    uuid: characteristic.uuid.to_string(),
                })?;
            self.listeners.fetch_add(1, Ordering::Relaxed);
            Some(characteristic.uuid)
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(LINK_EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();
        let mut notifications = self.peripheral.notifications().await?;
        let mut adapter_events = self.adapter.events().await?;
        let peripheral_id = self.peripheral.id();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pump_cancel.cancelled() => break,
                    maybe_notification = notifications.next() => {
                        match maybe_notification {
                            Some(notification) => {
                                if Some(notification.uuid) != notify_uuid {
                                    continue;
                                }
                                if tx.send(LinkEvent::Notification(notification.value)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = tx.send(LinkEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                    maybe_event = adapter_events.next() => {
                        match maybe_event {
                            Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                                let _ = tx.send(LinkEvent::Disconnected).await;
                                break;
                            }
                            Some(_) => {}
                            None => {
                                let _ = tx.send(LinkEvent::Disconnected).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        *self.pump.lock().await = Some(PumpHandle { cancel });
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), ConnectError> {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.cancel.cancel();
        }
        if let Some(characteristic) = &self.notify_char {
            if let Err(error) = self.peripheral.unsubscribe(characteristic).await {
                debug!(?error, "failed to unsubscribe cleanly");
            } else {
                self.listeners.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn disconnect(&self) -> Result<(), ConnectError> {
        if let Some(handle) = self.pump.lock().await.take() {
            handle.cancel.cancel();
        }
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
