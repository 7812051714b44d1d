use thiserror::Error;

use crate::session::SessionState;

/// Errors raised while establishing or using a BLE link.
///
/// Every variant is terminal for the current connect attempt; retries happen
/// at the session layer, never inside the transport.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("bluetooth stack did not become powered on within {waited_ms} ms")]
    PoweredOff { waited_ms: u64 },
    #[error("no matching peripheral was found before the scan deadline")]
    ScanTimeout,
    #[error("{count} peripherals matched and the multiple-device policy is `error`")]
    MultipleDevices { count: usize },
    #[error("peripheral is missing required characteristics: {missing}")]
    CharacteristicsMissing { missing: String },
    #[error("failed to subscribe to notify characteristic `{uuid}`")]
    SubscribeFailed { uuid: String },
    #[error("failed to connect to peripheral `{device}`: {detail}")]
    ConnectFailed { device: String, detail: String },
    #[error("connect attempt exceeded the {timeout_ms} ms deadline")]
    ConnectDeadline { timeout_ms: u64 },
    #[error("connect attempt was cancelled by session teardown")]
    Cancelled,
    #[error("transport is not connected")]
    NotConnected,
}

/// Errors surfaced to WebSocket handlers by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peripheral is claimed by a different session key.
    #[error("Another connection is active")]
    Busy,
    /// The session is not in a state that accepts this operation.
    #[error("session is {state} and cannot accept the operation")]
    NotActive { state: SessionState },
    /// The BLE link is down and the lazy reconnect also failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// The transport rejected a write.
    #[error("write failed: {detail}")]
    WriteFailed { detail: String },
    /// A `force_cleanup` carried a token that does not match this session.
    #[error("Invalid token")]
    InvalidToken,
}

/// Errors raised by illegal session state transitions.
#[derive(Debug, Error)]
#[error("illegal session state transition {from} -> {to} ({reason})")]
pub struct StateError {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: &'static str,
}

/// Errors raised while deriving a session request from the WebSocket URL.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("missing required `service` parameter")]
    MissingService,
    #[error("`{name}` is not a valid UUID: `{value}`")]
    InvalidUuid { name: &'static str, value: String },
    #[error("`timeout` is not a valid millisecond count: `{value}`")]
    InvalidTimeout { value: String },
    #[error("`onMultipleDevices` must be `first` or `error`, got `{value}`")]
    InvalidMultipleDevicePolicy { value: String },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
