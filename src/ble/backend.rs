use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::BleConfig;
use crate::error::ConnectError;

/// A peripheral surfaced during scanning.
///
/// Service UUIDs are stored normalized so selector comparisons never depend
/// on how the platform stack renders them.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: String,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<String>,
}

/// Scan match criteria derived from a session's [`BleConfig`].
#[derive(Debug, Clone)]
pub struct ScanSelector {
    pub name_prefix: Option<String>,
    pub service: String,
}

impl ScanSelector {
    #[must_use]
    pub fn from_config(config: &BleConfig) -> Self {
        Self {
            name_prefix: config.device_prefix.clone(),
            service: config.service.clone(),
        }
    }

    /// Name prefix beats service filter when both are provided.
    #[must_use]
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        match &self.name_prefix {
            Some(prefix) => device
                .local_name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix.as_str())),
            None => device
                .service_uuids
                .iter()
                .any(|uuid| uuid == &self.service),
        }
    }
}

/// Events emitted by an established link, in radio delivery order.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Notification(Vec<u8>),
    Disconnected,
}

/// Bookkeeping snapshot of the underlying stack, consumed by the zombie
/// detector and the scanner-recovery gate.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ResourceSnapshot {
    pub listener_count: usize,
    pub peripheral_count: usize,
}

/// Low-level radio operations provided by concrete backends.
///
/// The bridge process owns exactly one backend handle; tests substitute the
/// fake implementation.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Waits until the stack reports powered-on, bounded by `deadline`.
    async fn wait_powered_on(&self, deadline: Duration) -> Result<(), ConnectError>;

    /// Starts advertising discovery on every adapter.
    async fn start_scan(&self) -> Result<(), ConnectError>;

    /// Stops discovery on every adapter.
    async fn stop_scan(&self) -> Result<(), ConnectError>;

    /// Returns the peripherals visible so far in the current scan.
    async fn discovered(&self) -> Result<Vec<DiscoveredDevice>, ConnectError>;

    /// Connects to one discovered peripheral, resolves the configured
    /// characteristics, and returns the live link.
    async fn connect(
        &self,
        device_id: &str,
        config: &BleConfig,
    ) -> Result<Box<dyn BleLink>, ConnectError>;

    /// Current listener/peripheral bookkeeping.
    fn resource_snapshot(&self) -> ResourceSnapshot;
}

/// An established peripheral link with resolved characteristics.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// The peripheral's advertised local name, when it had one.
    fn device_name(&self) -> Option<String>;

    /// Writes to the write characteristic without response.
    async fn write(&self, payload: &[u8]) -> Result<(), ConnectError>;

    /// Subscribes to the notify characteristic and returns the event stream.
    async fn subscribe(&self) -> Result<mpsc::Receiver<LinkEvent>, ConnectError>;

    /// Drops the notify subscription.
    async fn unsubscribe(&self) -> Result<(), ConnectError>;

    /// Disconnects the peripheral if still connected.
    async fn disconnect(&self) -> Result<(), ConnectError>;
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn device(name: Option<&str>, services: &[&str]) -> DiscoveredDevice {
        DiscoveredDevice {
            id: "aa:bb:cc".to_string(),
            local_name: name.map(str::to_string),
            rssi: Some(-40),
            service_uuids: services.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    const SERVICE: &str = "0000980000001000800000805f9b34fb";

    #[rstest]
    #[case(Some("CS108"), Some("CS108Reader42"), &[], true)]
    #[case(Some("CS108"), Some("OtherReader"), &[SERVICE], false)]
    #[case(Some("CS108"), None, &[SERVICE], false)]
    #[case(None, None, &[SERVICE], true)]
    #[case(None, Some("CS108Reader42"), &[], false)]
    fn selector_prefers_name_prefix_over_service(
        #[case] prefix: Option<&str>,
        #[case] name: Option<&str>,
        #[case] services: &[&str],
        #[case] expected: bool,
    ) {
        let selector = ScanSelector {
            name_prefix: prefix.map(str::to_string),
            service: SERVICE.to_string(),
        };
        assert_eq!(expected, selector.matches(&device(name, services)));
    }
}
