mod app;
mod ble;
mod cli;
mod config;
mod error;
mod log_stream;
mod server;
mod session;
mod telemetry;
mod utils;

pub use app::{BridgeHandle, run, start};
pub use ble::{
    BleBackend, BleLink, BleTransport, BtleplugBackend, DiscoveredDevice, FakeBackend,
    FakeBackendConfig, FakeBackendHandle, FakeDevice, LinkEvent, ResourceSnapshot, ScanSelector,
    ScannerGate, TransportEvent, TransportState,
};
pub use cli::Args;
pub use config::{BleConfig, BridgeConfig, LogLevel, MultipleDevicePolicy};
pub use error::{ConnectError, QueryError, SessionError, StateError};
pub use log_stream::{ConnectionSnapshot, Direction, PacketLog, PacketLogEntry, SharedState};
pub use server::{BridgeRequest, ClientFrame, ServerFrame, WsRequest, parse_request};
pub use session::{
    AttachedClient, ConnectionMutex, ConnectionToken, Session, SessionEvent, SessionManager,
    SessionState, SocketId, StateMachine,
};
