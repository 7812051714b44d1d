use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::ble::FakeDevice;
use crate::config::LogLevel;

/// WebSocket-to-BLE bridge: serializes exclusive access to one peripheral
/// across many transient WebSocket clients.
#[derive(Debug, Parser)]
#[command(name = "ble-bridge", version)]
pub struct Args {
    /// Listen address for the WebSocket server.
    #[arg(long, env = "BLE_BRIDGE_BIND")]
    bind: Option<SocketAddr>,
    /// Log verbosity override.
    #[arg(long, value_enum)]
    log_level: Option<LogLevel>,
    /// Grace period after the last socket detaches, e.g. `5s`.
    #[arg(long, value_parser = parse_duration)]
    grace_period: Option<Duration>,
    /// Idle timeout before a silent session is evicted, e.g. `45s`.
    #[arg(long, value_parser = parse_duration)]
    idle_timeout: Option<Duration>,
    /// Serve against the fake backend instead of the radio.
    #[arg(long)]
    fake: bool,
    /// Fake device fixture `id|name|rssi|service[,service...]`; repeatable.
    #[arg(long, requires = "fake")]
    fake_device: Vec<String>,
}

impl Args {
    #[must_use]
    pub fn bind(&self) -> Option<SocketAddr> {
        self.bind
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn grace_period(&self) -> Option<Duration> {
        self.grace_period
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    #[must_use]
    pub fn fake(&self) -> bool {
        self.fake
    }

    /// Parses the `--fake-device` fixtures.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed fixture.
    pub fn fake_devices(&self) -> Result<Vec<FakeDevice>, String> {
        self.fake_device.iter().map(|raw| parse_fixture(raw)).collect()
    }
}

fn parse_duration(raw: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(raw)
}

fn parse_fixture(raw: &str) -> Result<FakeDevice, String> {
    let fields: Vec<&str> = raw.split('|').collect();
    let &[id, name, rssi, services] = fields.as_slice() else {
        return Err(format!(
            "fixture `{raw}` must have four pipe-delimited fields: id|name|rssi|services"
        ));
    };
    if id.is_empty() {
        return Err(format!("fixture `{raw}` has an empty device id"));
    }
    let rssi: i16 = rssi
        .parse()
        .map_err(|_| format!("fixture `{raw}` has a bad RSSI value `{rssi}`"))?;
    let services: Vec<&str> = services.split(',').filter(|s| !s.is_empty()).collect();

    let name = if name.is_empty() { None } else { Some(name) };
    Ok(FakeDevice::new(id, name, rssi, &services))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fixture_parses_all_fields() {
        let device =
            parse_fixture("aa:bb:cc|CS108Reader42|-43|9800,9900").expect("fixture should parse");
        assert_eq!("aa:bb:cc", device.id);
        assert_eq!(Some("CS108Reader42".to_string()), device.local_name);
        assert_eq!(Some(-43), device.rssi);
        assert_eq!(2, device.service_uuids.len());
    }

    #[test]
    fn fixture_with_missing_fields_is_rejected() {
        assert!(parse_fixture("aa:bb:cc|name|-43").is_err());
        assert!(parse_fixture("").is_err());
    }

    #[test]
    fn fixture_with_empty_name_becomes_anonymous() {
        let device = parse_fixture("aa:bb:cc||-43|9800").expect("fixture should parse");
        assert_eq!(None, device.local_name);
    }

    #[test]
    fn args_parse_with_fake_devices() {
        let args = Args::try_parse_from([
            "ble-bridge",
            "--fake",
            "--fake-device",
            "aa:bb:cc|CS108Reader42|-43|9800",
            "--log-level",
            "debug",
        ])
        .expect("args should parse");
        assert!(args.fake());
        assert_eq!(1, args.fake_devices().expect("fixtures should parse").len());
        assert_eq!(Some(LogLevel::Debug), args.log_level());
    }

    #[test]
    fn fake_device_requires_fake_flag() {
        let result = Args::try_parse_from([
            "ble-bridge",
            "--fake-device",
            "aa:bb:cc|CS108Reader42|-43|9800",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn duration_overrides_accept_humantime_forms() {
        let args = Args::try_parse_from(["ble-bridge", "--grace-period", "10s"])
            .expect("args should parse");
        assert_eq!(Some(Duration::from_secs(10)), args.grace_period());
    }
}
