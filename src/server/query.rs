use std::collections::HashMap;
use std::time::Duration;

use crate::config::{BleConfig, BridgeConfig, MultipleDevicePolicy};
use crate::error::QueryError;

/// What a WebSocket upgrade is asking for.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WsRequest {
    /// Drive a peripheral through a session.
    Bridge(BridgeRequest),
    /// Subscribe to the packet log instead.
    LogStream { filter: Option<String> },
}

/// A bridge upgrade: optional client-chosen key plus the BLE configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BridgeRequest {
    pub session_id: Option<String>,
    pub config: BleConfig,
}

/// Parses the upgrade URL's query string.
///
/// Recognized keys: `session`, `service`, `write`, `notify`, `device`,
/// `timeout` (ms), `onMultipleDevices`, and the special `command=log-stream`
/// with its optional `filter`. Unknown keys are ignored.
///
/// # Errors
///
/// Returns a [`QueryError`] when `service` is absent or any value is
/// malformed.
pub fn parse_request(query: Option<&str>, defaults: &BridgeConfig) -> Result<WsRequest, QueryError> {
    let pairs = parse_pairs(query.unwrap_or(""));

    if pairs.get("command").map(String::as_str) == Some("log-stream") {
        return Ok(WsRequest::LogStream {
            filter: pairs.get("filter").cloned(),
        });
    }

    let service = pairs
        .get("service")
        .filter(|value| !value.is_empty())
        .ok_or(QueryError::MissingService)?;

    let connect_timeout = match pairs.get("timeout") {
        Some(raw) => {
            let millis = raw
                .parse::<u64>()
                .map_err(|_| QueryError::InvalidTimeout { value: raw.clone() })?;
            Duration::from_millis(millis)
        }
        None => defaults.connect_timeout,
    };

    let on_multiple_devices = match pairs.get("onMultipleDevices") {
        Some(raw) => raw
            .parse::<MultipleDevicePolicy>()
            .map_err(|_| QueryError::InvalidMultipleDevicePolicy { value: raw.clone() })?,
        None => MultipleDevicePolicy::default(),
    };

    let config = BleConfig::new(
        service,
        pairs.get("write").map(String::as_str),
        pairs.get("notify").map(String::as_str),
        pairs.get("device").cloned(),
        connect_timeout,
        on_multiple_devices,
    )?;

    Ok(WsRequest::Bridge(BridgeRequest {
        session_id: pairs.get("session").filter(|v| !v.is_empty()).cloned(),
        config,
    }))
}

fn parse_pairs(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Minimal application/x-www-form-urlencoded decoding: `+` as space and
/// `%XX` escapes; invalid escapes pass through literally.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => match (hex_value(bytes.get(index + 1)), hex_value(bytes.get(index + 2))) {
                (Some(high), Some(low)) => {
                    decoded.push((high << 4) | low);
                    index += 3;
                }
                _ => {
                    decoded.push(b'%');
                    index += 1;
                }
            },
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
