//! Lifecycle invariants driven through the public API with the fake
//! backend: radio exclusivity, grace/eviction expiry, and TX ordering.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::sleep;

use ble_bridge::{
    BleConfig, BridgeConfig, FakeBackend, FakeBackendConfig, FakeBackendHandle, FakeDevice,
    MultipleDevicePolicy, PacketLog, SessionManager, SessionState, SharedState,
};

fn test_config() -> BridgeConfig {
    BridgeConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        grace_period: Duration::from_millis(200),
        idle_timeout: Duration::from_millis(600),
        eviction_grace: Duration::from_millis(200),
        scanner_recovery_base: Duration::ZERO,
        scanner_recovery_step: Duration::ZERO,
        scanner_recovery_cap: Duration::ZERO,
        multi_device_settle: Duration::from_millis(50),
        ..BridgeConfig::default()
    }
}

fn ble_config() -> BleConfig {
    BleConfig::new(
        "9800",
        Some("9900"),
        Some("9901"),
        Some("CS108".to_string()),
        Duration::from_secs(5),
        MultipleDevicePolicy::First,
    )
    .expect("config should build")
}

fn manager_over_fake() -> (Arc<SessionManager>, FakeBackendHandle, Arc<PacketLog>) {
    let backend = FakeBackend::new(
        FakeBackendConfig::builder()
            .devices(vec![FakeDevice::new(
                "aa:bb:cc",
                Some("CS108Reader42"),
                -43,
                &["9800"],
            )])
            .build(),
    );
    let handle = backend.handle();
    let packet_log = Arc::new(PacketLog::new(64));
    let manager = SessionManager::new(
        test_config(),
        Arc::new(backend),
        Arc::clone(&packet_log),
        Arc::new(SharedState::default()),
    );
    (manager, handle, packet_log)
}

#[tokio::test]
async fn at_most_one_session_is_active_with_the_radio_claimed() -> anyhow::Result<()> {
    let (manager, _fake, _log) = manager_over_fake();

    let first = manager.get_or_create(Some("s1".to_string()), ble_config())?;
    first.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;
    assert_eq!(SessionState::Active, first.state());

    let second = manager.get_or_create(Some("s2".to_string()), ble_config())?;
    assert!(second.attach(2).await.is_err());
    assert_eq!(SessionState::Idle, second.state());

    let active = manager
        .list()
        .into_iter()
        .filter(|session| session.state() == SessionState::Active)
        .count();
    assert_eq!(1, active);
    Ok(())
}

#[tokio::test]
async fn empty_session_is_gone_after_grace_plus_eviction() -> anyhow::Result<()> {
    let (manager, _fake, _log) = manager_over_fake();

    let session = manager.get_or_create(Some("s1".to_string()), ble_config())?;
    session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;
    session.detach(1);

    // grace (200ms) + eviction grace (200ms) with margin
    sleep(Duration::from_millis(600)).await;
    assert_eq!(SessionState::Idle, session.state());
    assert!(manager.get("s1").is_none());
    assert_eq!(0, manager.count());
    Ok(())
}

#[tokio::test]
async fn tx_log_entries_match_the_write_sequence() -> anyhow::Result<()> {
    let (manager, fake, log) = manager_over_fake();

    let session = manager.get_or_create(Some("s1".to_string()), ble_config())?;
    session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

    let payloads = [vec![0x01u8], vec![0x02, 0x03], vec![0x04]];
    for payload in &payloads {
        session.write(payload).await.map_err(|e| anyhow::anyhow!(e))?;
    }

    assert_eq!(payloads.to_vec(), fake.written());
    let logged: Vec<Vec<u8>> = log
        .entries_after(0)
        .into_iter()
        .filter(|entry| entry.direction == ble_bridge::Direction::Tx)
        .map(|entry| entry.bytes)
        .collect();
    assert_eq!(payloads.to_vec(), logged);
    Ok(())
}

#[tokio::test]
async fn shared_state_snapshot_follows_the_session() -> anyhow::Result<()> {
    let backend = FakeBackend::new(
        FakeBackendConfig::builder()
            .devices(vec![FakeDevice::new(
                "aa:bb:cc",
                Some("CS108Reader42"),
                -43,
                &["9800"],
            )])
            .build(),
    );
    let shared = Arc::new(SharedState::default());
    let manager = SessionManager::new(
        test_config(),
        Arc::new(backend),
        Arc::new(PacketLog::new(64)),
        Arc::clone(&shared),
    );

    let session = manager.get_or_create(Some("s1".to_string()), ble_config())?;
    session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

    let snapshot = shared.snapshot();
    assert!(snapshot.connected);
    assert_eq!(Some("CS108Reader42".to_string()), snapshot.device_name);
    assert_eq!(Some("s1".to_string()), snapshot.session_id);

    session.force_cleanup("client request").await;
    assert!(!shared.snapshot().connected);
    Ok(())
}
