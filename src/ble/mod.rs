mod backend;
mod btleplug_backend;
mod fake_backend;
mod transport;

pub use self::backend::{BleBackend, BleLink, DiscoveredDevice, LinkEvent, ResourceSnapshot, ScanSelector};
pub use self::btleplug_backend::BtleplugBackend;
pub use self::fake_backend::{FakeBackend, FakeBackendConfig, FakeBackendHandle, FakeDevice};
pub use self::transport::{BleTransport, ScannerGate, TransportEvent, TransportState};
