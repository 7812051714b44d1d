use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use strum_macros::EnumString;
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;

use crate::error::QueryError;
use crate::utils::normalize_uuid;

/// Log verbosity recognized by the bridge.
///
/// Aliases carried over from earlier deployments are normalized on parse:
/// `verbose` and `trace` collapse to debug, `warn` to info.
#[derive(Debug, Clone, Copy, Eq, PartialEq, EnumString, clap::ValueEnum)]
#[strum(ascii_case_insensitive)]
pub enum LogLevel {
    #[strum(serialize = "debug", serialize = "verbose", serialize = "trace")]
    Debug,
    #[strum(serialize = "info", serialize = "warn")]
    Info,
    #[strum(serialize = "error")]
    Error,
}

impl LogLevel {
    #[must_use]
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Error => LevelFilter::ERROR,
        }
    }
}

/// Device selection behavior when a scan surfaces more than one match.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum MultipleDevicePolicy {
    /// Connect to the first match.
    #[default]
    First,
    /// Fail the connect attempt.
    Error,
}

/// Per-session BLE configuration derived from the WebSocket URL.
///
/// UUIDs are stored normalized (lower-case, dash-free, shorthands expanded)
/// so equality is comparison-safe against whatever form the radio reports.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BleConfig {
    pub service: String,
    pub write: Option<String>,
    pub notify: Option<String>,
    pub device_prefix: Option<String>,
    pub connect_timeout: Duration,
    pub on_multiple_devices: MultipleDevicePolicy,
}

impl BleConfig {
    /// Builds a config from raw UUID strings, normalizing each.
    ///
    /// # Errors
    ///
    /// Returns an error when any UUID is malformed.
    pub fn new(
        service: &str,
        write: Option<&str>,
        notify: Option<&str>,
        device_prefix: Option<String>,
        connect_timeout: Duration,
        on_multiple_devices: MultipleDevicePolicy,
    ) -> Result<Self, QueryError> {
        let service = normalize_uuid(service).ok_or_else(|| QueryError::InvalidUuid {
            name: "service",
            value: service.to_string(),
        })?;
        let write = write
            .map(|raw| {
                normalize_uuid(raw).ok_or_else(|| QueryError::InvalidUuid {
                    name: "write",
                    value: raw.to_string(),
                })
            })
            .transpose()?;
        let notify = notify
            .map(|raw| {
                normalize_uuid(raw).ok_or_else(|| QueryError::InvalidUuid {
                    name: "notify",
                    value: raw.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            service,
            write,
            notify,
            device_prefix,
            connect_timeout,
            on_multiple_devices,
        })
    }

    /// Two configs are compatible when they target the same endpoints; the
    /// timeout and multiplicity policy are per-attach and do not split
    /// sessions.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.service == other.service
            && self.write == other.write
            && self.notify == other.notify
            && self.device_prefix == other.device_prefix
    }
}

/// Process-wide timing and capacity knobs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    pub grace_period: Duration,
    pub idle_timeout: Duration,
    pub eviction_grace: Duration,
    pub stale_claim_timeout: Duration,
    pub sweep_interval: Duration,
    pub scanner_recovery_base: Duration,
    pub scanner_recovery_step: Duration,
    pub scanner_recovery_cap: Duration,
    pub connect_timeout: Duration,
    pub scan_deadline: Duration,
    pub multi_device_settle: Duration,
    pub packet_log_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            grace_period: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(45),
            eviction_grace: Duration::from_secs(5),
            stale_claim_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            scanner_recovery_base: Duration::from_secs(2),
            scanner_recovery_step: Duration::from_millis(500),
            scanner_recovery_cap: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            scan_deadline: Duration::from_secs(10),
            multi_device_settle: Duration::from_secs(1),
            packet_log_capacity: 1024,
        }
    }
}

impl BridgeConfig {
    /// Reads overrides from the environment, falling back to defaults.
    ///
    /// Unparseable values are logged and ignored rather than aborting
    /// startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_parsed::<SocketAddr>("BLE_BRIDGE_BIND") {
            config.bind_addr = addr;
        }
        apply_secs("BLE_SESSION_GRACE_PERIOD_SEC", &mut config.grace_period);
        apply_secs("BLE_SESSION_IDLE_TIMEOUT_SEC", &mut config.idle_timeout);
        apply_secs("BLE_SESSION_EVICTION_GRACE_SEC", &mut config.eviction_grace);
        apply_secs("BLE_STALE_CLAIM_TIMEOUT_SEC", &mut config.stale_claim_timeout);
        apply_secs("BLE_ZOMBIE_SWEEP_INTERVAL_SEC", &mut config.sweep_interval);
        apply_millis("BLE_SCANNER_RECOVERY_BASE_MS", &mut config.scanner_recovery_base);
        apply_millis("BLE_SCANNER_RECOVERY_STEP_MS", &mut config.scanner_recovery_step);
        apply_millis("BLE_SCANNER_RECOVERY_CAP_MS", &mut config.scanner_recovery_cap);
        apply_millis("BLE_CONNECT_TIMEOUT_MS", &mut config.connect_timeout);
        apply_millis("BLE_SCAN_DEADLINE_MS", &mut config.scan_deadline);
        if let Some(capacity) = env_parsed::<usize>("BLE_PACKET_LOG_CAPACITY") {
            config.packet_log_capacity = capacity.max(1);
        }

        config
    }

    /// Resolves the configured log level, honoring aliases.
    #[must_use]
    pub fn log_level_from_env() -> Option<LogLevel> {
        let raw = env::var("BLE_BRIDGE_LOG_LEVEL").ok()?;
        match raw.parse::<LogLevel>() {
            Ok(level) => Some(level),
            Err(_) => {
                warn!(value = %raw, "unrecognized BLE_BRIDGE_LOG_LEVEL; keeping default");
                None
            }
        }
    }
}

fn apply_secs(key: &str, slot: &mut Duration) {
    if let Some(secs) = env_parsed::<u64>(key) {
        *slot = Duration::from_secs(secs);
    }
}

fn apply_millis(key: &str, slot: &mut Duration) {
    if let Some(millis) = env_parsed::<u64>(key) {
        *slot = Duration::from_millis(millis);
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(%key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("debug", LogLevel::Debug)]
    #[case("verbose", LogLevel::Debug)]
    #[case("trace", LogLevel::Debug)]
    #[case("info", LogLevel::Info)]
    #[case("warn", LogLevel::Info)]
    #[case("error", LogLevel::Error)]
    #[case("ERROR", LogLevel::Error)]
    fn log_level_normalizes_aliases(#[case] raw: &str, #[case] expected: LogLevel) {
        assert_eq!(Ok(expected), raw.parse::<LogLevel>());
    }

    #[test]
    fn log_level_rejects_unknown_values() {
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[rstest]
    #[case("first", MultipleDevicePolicy::First)]
    #[case("error", MultipleDevicePolicy::Error)]
    #[case("First", MultipleDevicePolicy::First)]
    fn multiple_device_policy_parses(#[case] raw: &str, #[case] expected: MultipleDevicePolicy) {
        assert_eq!(Ok(expected), raw.parse::<MultipleDevicePolicy>());
    }

    fn config(service: &str, write: Option<&str>, prefix: Option<&str>) -> BleConfig {
        BleConfig::new(
            service,
            write,
            None,
            prefix.map(str::to_string),
            Duration::from_secs(5),
            MultipleDevicePolicy::First,
        )
        .expect("test config should build")
    }

    #[test]
    fn configs_with_equivalent_uuid_forms_are_compatible() {
        let short = config("9800", Some("9900"), None);
        let long = config(
            "00009800-0000-1000-8000-00805f9b34fb",
            Some("00009900-0000-1000-8000-00805F9B34FB"),
            None,
        );
        assert!(short.is_compatible_with(&long));
    }

    #[test]
    fn configs_with_different_endpoints_are_incompatible() {
        let a = config("9800", Some("9900"), None);
        let b = config("9800", Some("9901"), None);
        assert!(!a.is_compatible_with(&b));
    }

    #[test]
    fn timeout_differences_do_not_split_sessions() {
        let mut a = config("9800", None, Some("CS108"));
        let b = config("9800", None, Some("CS108"));
        a.connect_timeout = Duration::from_secs(1);
        assert!(a.is_compatible_with(&b));
    }

    #[test]
    fn invalid_service_uuid_is_rejected() {
        let result = BleConfig::new(
            "zzzz",
            None,
            None,
            None,
            Duration::from_secs(5),
            MultipleDevicePolicy::First,
        );
        assert!(matches!(
            result,
            Err(QueryError::InvalidUuid { name: "service", .. })
        ));
    }
}
