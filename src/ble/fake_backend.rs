use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use super::backend::{BleBackend, BleLink, DiscoveredDevice, LinkEvent, ResourceSnapshot};
use crate::config::BleConfig;
use crate::error::ConnectError;
use crate::utils::normalize_uuid;

const LINK_EVENT_CHANNEL_CAPACITY: usize = 64;

/// One scripted peripheral visible to fake scans.
#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub id: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<String>,
}

impl FakeDevice {
    /// Creates a fixture device; service UUIDs accept any normalizable form.
    #[must_use]
    pub fn new(id: &str, local_name: Option<&str>, rssi: i16, services: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            local_name: local_name.map(str::to_string),
            rssi: Some(rssi),
            service_uuids: services
                .iter()
                .filter_map(|raw| normalize_uuid(raw))
                .collect(),
        }
    }
}

/// Scripted backend behaviour for tests and `--fake` runs.
#[derive(Debug, Clone, Default, Builder)]
pub struct FakeBackendConfig {
    /// Peripherals surfaced once a scan is running.
    #[builder(default)]
    pub devices: Vec<FakeDevice>,
    /// Wall-clock delay before devices become visible.
    #[builder(default)]
    pub discovery_delay: Duration,
    /// Simulates a stack that never powers on.
    #[builder(default)]
    pub powered_off: bool,
    /// Simulates a peripheral without the configured characteristics.
    #[builder(default)]
    pub missing_characteristics: bool,
    /// Simulates a subscribe failure during connect.
    #[builder(default)]
    pub fail_subscribe: bool,
}

#[derive(Debug, Default)]
struct FakeShared {
    scanning: bool,
    scan_count: usize,
    connect_count: usize,
    writes: Vec<Vec<u8>>,
    link_up: bool,
    notify_tx: Option<mpsc::Sender<LinkEvent>>,
}

/// Test-side control surface over a [`FakeBackend`].
#[derive(Clone)]
pub struct FakeBackendHandle {
    shared: Arc<Mutex<FakeShared>>,
    listeners: Arc<AtomicUsize>,
}

impl FakeBackendHandle {
    /// Injects a notification as if the peripheral had sent it.
    ///
    /// Returns false when no link is subscribed.
    pub async fn push_notification(&self, bytes: &[u8]) -> bool {
        let tx = {
            let shared = self.shared.lock().expect("fake backend lock poisoned");
            shared.notify_tx.clone()
        };
        match tx {
            Some(tx) => tx.send(LinkEvent::Notification(bytes.to_vec())).await.is_ok(),
            None => false,
        }
    }

    /// Drops the active link as if the peripheral had gone away.
    pub async fn drop_link(&self) {
        let tx = {
            let mut shared = self.shared.lock().expect("fake backend lock poisoned");
            shared.link_up = false;
            shared.notify_tx.take()
        };
        if let Some(tx) = tx {
            let _ = tx.send(LinkEvent::Disconnected).await;
        }
    }

    /// Payloads written so far, in write order.
    #[must_use]
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .expect("fake backend lock poisoned")
            .writes
            .clone()
    }

    /// How many scans have been started.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.shared
            .lock()
            .expect("fake backend lock poisoned")
            .scan_count
    }

    /// How many connects have completed.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared
            .lock()
            .expect("fake backend lock poisoned")
            .connect_count
    }

    /// Overrides the reported listener pressure.
    pub fn set_listener_count(&self, count: usize) {
        self.listeners.store(count, Ordering::Relaxed);
    }
}

/// Fake radio backend driven entirely by fixtures.
pub struct FakeBackend {
    config: FakeBackendConfig,
    shared: Arc<Mutex<FakeShared>>,
    listeners: Arc<AtomicUsize>,
}

impl FakeBackend {
    #[must_use]
    pub fn new(config: FakeBackendConfig) -> Self {
        info!("using fake BLE backend");
        Self {
            config,
            shared: Arc::new(Mutex::new(FakeShared::default())),
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the control handle shared with tests.
    #[must_use]
    pub fn handle(&self) -> FakeBackendHandle {
        FakeBackendHandle {
            shared: Arc::clone(&self.shared),
            listeners: Arc::clone(&self.listeners),
        }
    }
}

#[async_trait]
impl BleBackend for FakeBackend {
    async fn wait_powered_on(&self, deadline: Duration) -> Result<(), ConnectError> {
        if self.config.powered_off {
            sleep(deadline).await;
            return Err(ConnectError::PoweredOff {
                waited_ms: deadline.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), ConnectError> {
        if !self.config.discovery_delay.is_zero() {
            sleep(self.config.discovery_delay).await;
        }
        let mut shared = self.shared.lock().expect("fake backend lock poisoned");
        shared.scanning = true;
        shared.scan_count += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), ConnectError> {
        self.shared
            .lock()
            .expect("fake backend lock poisoned")
            .scanning = false;
        Ok(())
    }

    async fn discovered(&self) -> Result<Vec<DiscoveredDevice>, ConnectError> {
        let shared = self.shared.lock().expect("fake backend lock poisoned");
        if !shared.scanning {
            return Ok(Vec::new());
        }
        Ok(self
            .config
            .devices
            .iter()
            .map(|device| DiscoveredDevice {
                id: device.id.clone(),
                local_name: device.local_name.clone(),
                rssi: device.rssi,
                service_uuids: device.service_uuids.clone(),
            })
            .collect())
    }

    async fn connect(
        &self,
        device_id: &str,
        config: &BleConfig,
    ) -> Result<Box<dyn BleLink>, ConnectError> {
        let device = self
            .config
            .devices
            .iter()
            .find(|device| device.id == device_id)
            .ok_or_else(|| ConnectError::ConnectFailed {
                device: device_id.to_string(),
                detail: "peripheral disappeared after scan".to_string(),
            })?;

        if self.config.missing_characteristics {
            let mut missing = Vec::new();
            if let Some(uuid) = &config.write {
                missing.push(format!("write {uuid}"));
            }
            if let Some(uuid) = &config.notify {
                missing.push(format!("notify {uuid}"));
            }
            return Err(ConnectError::CharacteristicsMissing {
                missing: missing.join(", "),
            });
        }

        {
            let mut shared = self.shared.lock().expect("fake backend lock poisoned");
            shared.connect_count += 1;
            shared.link_up = true;
        }
        debug!(device = %device_id, "fake connect complete");

        Ok(Box::new(FakeLink {
            device_name: device.local_name.clone(),
            notify_uuid: config.notify.clone(),
            fail_subscribe: self.config.fail_subscribe,
            shared: Arc::clone(&self.shared),
            listeners: Arc::clone(&self.listeners),
        }))
    }

    fn resource_snapshot(&self) -> ResourceSnapshot {
        let peripheral_count = self
            .shared
            .lock()
            .expect("fake backend lock poisoned")
            .connect_count;
        ResourceSnapshot {
            listener_count: self.listeners.load(Ordering::Relaxed),
            peripheral_count,
        }
    }
}

struct FakeLink {
    device_name: Option<String>,
    notify_uuid: Option<String>,
    fail_subscribe: bool,
    shared: Arc<Mutex<FakeShared>>,
    listeners: Arc<AtomicUsize>,
}

#[async_trait]
impl BleLink for FakeLink {
    fn device_name(&self) -> Option<String> {
        self.device_name.clone()
    }

    async fn write(&self, payload: &[u8]) -> Result<(), ConnectError> {
        let mut shared = self.shared.lock().expect("fake backend lock poisoned");
        if !shared.link_up {
            return Err(ConnectError::ConnectFailed {
                device: "fake".to_string(),
                detail: "link is down".to_string(),
            });
        }
        shared.writes.push(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkEvent>, ConnectError> {
        if self.fail_subscribe {
            return Err(ConnectError::SubscribeFailed {
                uuid: self.notify_uuid.clone().unwrap_or_else(|| "none".to_string()),
            });
        }

        let (tx, rx) = mpsc::channel(LINK_EVENT_CHANNEL_CAPACITY);
        self.shared
            .lock()
            .expect("fake backend lock poisoned")
            .notify_tx = Some(tx);
        self.listeners.fetch_add(1, Ordering::Relaxed);
        Ok(rx)
    }

    async fn unsubscribe(&self) -> Result<(), ConnectError> {
        let removed = self
            .shared
            .lock()
            .expect("fake backend lock poisoned")
            .notify_tx
            .take()
            .is_some();
        if removed {
            self.listeners.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectError> {
        let mut shared = self.shared.lock().expect("fake backend lock poisoned");
        shared.link_up = false;
        shared.notify_tx = None;
        Ok(())
    }
}
