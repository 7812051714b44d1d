use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection_mutex::{ConnectionMutex, ConnectionToken};
use super::manager::Registry;
use super::state::{SessionState, StateMachine};
use crate::ble::{BleBackend, BleTransport, ResourceSnapshot, ScannerGate, TransportEvent, TransportState};
use crate::config::{BleConfig, BridgeConfig};
use crate::error::{ConnectError, SessionError};
use crate::log_stream::{Direction, PacketLog, SharedState};
use crate::utils::format_hex;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const WRITE_FAILURE_WINDOW: Duration = Duration::from_secs(30);
const WRITE_FAILURE_LIMIT: usize = 5;

/// Identifier of one attached WebSocket, assigned by the server.
pub type SocketId = u64;

/// Events a session fans out to every attached socket.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Notification bytes from the peripheral.
    Data(Vec<u8>),
    /// The BLE link dropped; the session remains reattachable and will
    /// reconnect lazily on the next write.
    Disconnected,
    /// Terminal: the session has been cleaned up; sockets close normally
    /// with this reason.
    Closed { reason: String },
}

/// Everything a socket handler needs after a successful attach.
#[derive(Debug)]
pub struct AttachedClient {
    pub events: broadcast::Receiver<SessionEvent>,
    pub session_id: String,
    pub device_name: Option<String>,
    pub token: String,
}

/// Timing knobs a session needs, extracted from [`BridgeConfig`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionTiming {
    pub grace_period: Duration,
    pub idle_timeout: Duration,
    pub eviction_grace: Duration,
}

impl SessionTiming {
    pub(crate) fn from_config(config: &BridgeConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            idle_timeout: config.idle_timeout,
            eviction_grace: config.eviction_grace,
        }
    }
}

struct SessionInner {
    machine: StateMachine,
    attached: HashSet<SocketId>,
    last_activity: Instant,
    grace_timer: Option<CancellationToken>,
    idle_timer: Option<CancellationToken>,
    eviction_timer: Option<CancellationToken>,
    evicting_since: Option<Instant>,
    eviction_deadline: Option<Instant>,
    /// True when the eviction came from the idle timer and activity may
    /// still cancel it.
    eviction_resumable: bool,
    write_failures: VecDeque<Instant>,
    closed: bool,
}

/// A long-lived claim on the BLE radio, identified by an opaque key and
/// outliving individual WebSocket connections.
///
/// Owns one transport, one connection-mutex token, and the set of attached
/// sockets. All timers live here; the state machine is the sole authority on
/// which are armed in which state.
pub struct Session {
    session_id: String,
    config: BleConfig,
    token: ConnectionToken,
    timing: SessionTiming,
    transport: Arc<BleTransport>,
    mutex: Arc<ConnectionMutex>,
    packet_log: Arc<PacketLog>,
    shared_state: Arc<SharedState>,
    registry: Weak<Registry>,
    events_tx: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
    /// Serializes connect attempts so a reconnect never races another.
    connect_serial: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    weak_self: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: String,
        config: BleConfig,
        backend: Arc<dyn BleBackend>,
        gate: Arc<ScannerGate>,
        bridge_config: &BridgeConfig,
        mutex: Arc<ConnectionMutex>,
        packet_log: Arc<PacketLog>,
        shared_state: Arc<SharedState>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let transport = BleTransport::new(
            backend,
            gate,
            bridge_config.scan_deadline,
            bridge_config.multi_device_settle,
            transport_tx,
            cancel.clone(),
        );
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let session = Arc::new_cyclic(|weak| Self {
            session_id,
            config,
            token: ConnectionToken::generate(),
            timing: SessionTiming::from_config(bridge_config),
            transport,
            mutex,
            packet_log,
            shared_state,
            registry,
            events_tx,
            inner: Mutex::new(SessionInner {
                machine: StateMachine::default(),
                attached: HashSet::new(),
                last_activity: Instant::now(),
                grace_timer: None,
                idle_timer: None,
                eviction_timer: None,
                evicting_since: None,
                eviction_deadline: None,
                eviction_resumable: false,
                write_failures: VecDeque::new(),
                closed: false,
            }),
            connect_serial: tokio::sync::Mutex::new(()),
            cancel,
            weak_self: weak.clone(),
        });
        session.spawn_transport_pump(transport_rx);
        session
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().expect("session lock poisoned").machine.current()
    }

    #[must_use]
    pub fn device_name(&self) -> Option<String> {
        self.transport.device_name()
    }

    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.inner.lock().expect("session lock poisoned").attached.len()
    }

    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.inner.lock().expect("session lock poisoned").last_activity
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("session lock poisoned").closed
    }

    #[must_use]
    pub(crate) fn evicting_since(&self) -> Option<Instant> {
        self.inner.lock().expect("session lock poisoned").evicting_since
    }

    #[must_use]
    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        self.transport.resource_snapshot()
    }

    /// Subscribes to this session's fan-out without attaching.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Whether the token a client presented authorizes force-cleanup.
    #[must_use]
    pub fn token_matches(&self, raw: &str) -> bool {
        self.token.as_str() == raw
    }

    /// Attaches a socket, claiming the radio and connecting lazily when this
    /// is the first attachment.
    ///
    /// Suspends while the transport connects, bounded by the config timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] when the session is evicting or the
    /// radio is claimed elsewhere, or a typed connect error when the lazy
    /// connect fails (in which case a first attachment is fully rolled back).
    #[instrument(skip(self), level = "debug", fields(session = %self.session_id, socket))]
    pub async fn attach(&self, socket: SocketId) -> Result<AttachedClient, SessionError> {
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            if inner.closed {
                return Err(SessionError::Busy);
            }
            match inner.machine.current() {
                SessionState::Evicting => return Err(SessionError::Busy),
                SessionState::Idle => {
                    if !self.mutex.try_claim(&self.token) {
                        return Err(SessionError::Busy);
                    }
                    inner
                        .machine
                        .transition(SessionState::Active, "first socket attached")
                        .expect("IDLE accepts ACTIVE");
                }
                SessionState::Active => {
                    if let Some(timer) = inner.grace_timer.take() {
                        timer.cancel();
                        debug!(session = %self.session_id, "socket reattached within grace");
                    }
                }
            }
            inner.attached.insert(socket);
        }
        self.arm_idle_timer();

        if let Err(error) = self.ensure_connected().await {
            self.rollback_attach(socket);
            return Err(SessionError::Connect(error));
        }

        Ok(AttachedClient {
            events: self.events_tx.subscribe(),
            session_id: self.session_id.clone(),
            device_name: self.transport.device_name(),
            token: self.token.as_str().to_string(),
        })
    }

    /// Undoes a failed first attach so the key does not stay claimed.
    fn rollback_attach(&self, socket: SocketId) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        inner.attached.remove(&socket);
        if inner.attached.is_empty() && inner.machine.current() == SessionState::Active {
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            inner
                .machine
                .transition(SessionState::Idle, "connect failed")
                .expect("ACTIVE accepts IDLE");
            self.mutex.release(&self.token);
        }
    }

    /// Detaches a socket; arms the grace timer when the set drains while
    /// ACTIVE so a returning client can reclaim the same transport.
    pub fn detach(&self, socket: SocketId) {
        let arm_grace = {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            inner.attached.remove(&socket);
            inner.attached.is_empty()
                && inner.machine.current() == SessionState::Active
                && !inner.closed
        };
        if arm_grace {
            self.arm_grace_timer();
        }
    }

    /// Writes client bytes to the peripheral.
    ///
    /// Requires ACTIVE (or an idle-eviction still inside its grace, which
    /// the activity cancels). Reconnects lazily after link loss. TX entries
    /// are appended to the packet log in completion order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] outside ACTIVE, a connect error
    /// when the lazy reconnect fails, or [`SessionError::WriteFailed`] when
    /// the transport rejects the write.
    #[instrument(skip(self, bytes), level = "trace", fields(session = %self.session_id, len = bytes.len()))]
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            self.note_activity(&mut inner)?;
        }
        self.arm_idle_timer();
        self.mutex.refresh(&self.token);

        self.ensure_connected().await?;

        match self.transport.write(bytes).await {
            Ok(()) => {
                debug!(session = %self.session_id, payload = %format_hex(bytes), "TX");
                self.packet_log.append(Direction::Tx, &self.session_id, bytes);
                self.shared_state.record_activity();
                Ok(())
            }
            Err(error) => {
                self.record_write_failure();
                Err(SessionError::WriteFailed {
                    detail: error.to_string(),
                })
            }
        }
    }

    /// Marks activity, resuming from an idle eviction when still allowed.
    fn note_activity(&self, inner: &mut SessionInner) -> Result<(), SessionError> {
        match inner.machine.current() {
            SessionState::Active => {}
            SessionState::Evicting
                if inner.eviction_resumable
                    && inner
                        .eviction_deadline
                        .is_some_and(|deadline| Instant::now() < deadline) =>
            {
                inner
                    .machine
                    .transition(SessionState::Idle, "activity resumed")
                    .expect("EVICTING accepts IDLE");
                inner
                    .machine
                    .transition(SessionState::Active, "client resumed")
                    .expect("IDLE accepts ACTIVE");
                if let Some(timer) = inner.eviction_timer.take() {
                    timer.cancel();
                }
                inner.evicting_since = None;
                inner.eviction_deadline = None;
                inner.eviction_resumable = false;
            }
            state => return Err(SessionError::NotActive { state }),
        }
        inner.last_activity = Instant::now();
        Ok(())
    }

    /// Lazily connects the transport, serialized across callers.
    async fn ensure_connected(&self) -> Result<(), ConnectError> {
        if self.transport.state() == TransportState::Connected {
            return Ok(());
        }
        let _serial = self.connect_serial.lock().await;
        if self.transport.state() == TransportState::Connected {
            return Ok(());
        }
        if !self.transport.try_claim_connection() {
            return Err(ConnectError::NotConnected);
        }
        self.transport.connect(&self.config).await?;
        self.mutex.refresh(&self.token);
        self.shared_state
            .record_connected(&self.session_id, self.transport.device_name().as_deref());
        Ok(())
    }

    fn record_write_failure(&self) {
        let unhealthy = {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            let now = Instant::now();
            inner.write_failures.push_back(now);
            while let Some(&oldest) = inner.write_failures.front() {
                if now.duration_since(oldest) > WRITE_FAILURE_WINDOW {
                    inner.write_failures.pop_front();
                } else {
                    break;
                }
            }
            inner.write_failures.len() >= WRITE_FAILURE_LIMIT
        };
        if unhealthy {
            warn!(session = %self.session_id, "repeated write failures inside the window");
            if let Some(session) = self.weak_self.upgrade() {
                tokio::spawn(async move {
                    session.force_cleanup("transport-unhealthy").await;
                });
            }
        }
    }

    fn spawn_transport_pump(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe_event = events.recv() => {
                        let Some(session) = weak.upgrade() else { break };
                        match maybe_event {
                            Some(TransportEvent::Data(bytes)) => session.on_transport_data(bytes),
                            Some(TransportEvent::Disconnected) => {
                                session.on_transport_disconnected().await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    /// Fans a notification out to every attached socket and logs RX.
    fn on_transport_data(&self, bytes: Vec<u8>) {
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            // RX counts as activity too; a device that keeps notifying is
            // not idle even if clients only listen.
            if self.note_activity(&mut inner).is_err() {
                return;
            }
        }
        self.arm_idle_timer();
        self.mutex.refresh(&self.token);
        debug!(session = %self.session_id, payload = %format_hex(&bytes), "RX");
        self.packet_log.append(Direction::Rx, &self.session_id, &bytes);
        self.shared_state.record_activity();
        let _ = self.events_tx.send(SessionEvent::Data(bytes));
    }

    /// Peripheral link loss. The session is only discarded when nothing is
    /// attached; clients that remain attached get `disconnected` and are
    /// expected to trigger a reconnect with their next write.
    async fn on_transport_disconnected(&self) {
        self.shared_state.record_disconnected();
        let attached = self.attached_count();
        if attached == 0 {
            self.force_cleanup("transport disconnect").await;
        } else {
            info!(session = %self.session_id, attached, "link lost with clients attached");
            let _ = self.events_tx.send(SessionEvent::Disconnected);
        }
    }

    fn arm_grace_timer(&self) {
        let token = CancellationToken::new();
        let deadline = Instant::now() + self.timing.grace_period;
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            if let Some(previous) = inner.grace_timer.replace(token.clone()) {
                previous.cancel();
            }
        }
        debug!(session = %self.session_id, "grace timer armed");

        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = cancel.cancelled() => {}
                () = sleep_until(deadline) => {
                    if let Some(session) = weak.upgrade() {
                        session.on_grace_expired();
                    }
                }
            }
        });
    }

    fn on_grace_expired(&self) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        if inner.closed
            || !inner.attached.is_empty()
            || inner.machine.current() != SessionState::Active
        {
            return;
        }
        self.begin_eviction(&mut inner, "grace expired", "grace expired", false);
    }

    fn arm_idle_timer(&self) {
        let token = CancellationToken::new();
        let deadline = Instant::now() + self.timing.idle_timeout;
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            if inner.closed || inner.machine.current() != SessionState::Active {
                return;
            }
            if let Some(previous) = inner.idle_timer.replace(token.clone()) {
                previous.cancel();
            }
        }

        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = cancel.cancelled() => {}
                () = sleep_until(deadline) => {
                    if let Some(session) = weak.upgrade() {
                        session.on_idle_expired();
                    }
                }
            }
        });
    }

    fn on_idle_expired(&self) {
        let mut inner = self.inner.lock().expect("session lock poisoned");
        if inner.closed || inner.machine.current() != SessionState::Active {
            return;
        }
        self.begin_eviction(&mut inner, "idle timeout", "idle eviction", true);
    }

    /// Moves ACTIVE to EVICTING and schedules the force-cleanup deadline.
    fn begin_eviction(
        &self,
        inner: &mut SessionInner,
        transition_reason: &'static str,
        cleanup_reason: &'static str,
        resumable: bool,
    ) {
        if inner
            .machine
            .transition(SessionState::Evicting, transition_reason)
            .is_err()
        {
            return;
        }
        let now = Instant::now();
        inner.evicting_since = Some(now);
        inner.eviction_deadline = Some(now + self.timing.eviction_grace);
        inner.eviction_resumable = resumable;
        if let Some(timer) = inner.idle_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = inner.grace_timer.take() {
            timer.cancel();
        }

        let token = CancellationToken::new();
        let deadline = inner.eviction_deadline.expect("deadline just set");
        inner.eviction_timer = Some(token.clone());

        let weak = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = cancel.cancelled() => {}
                () = sleep_until(deadline) => {
                    if let Some(session) = weak.upgrade() {
                        session.force_cleanup(cleanup_reason).await;
                    }
                }
            }
        });
    }

    /// True when the session has sat in EVICTING past its deadline.
    #[must_use]
    pub(crate) fn eviction_deadline_passed(&self) -> bool {
        let inner = self.inner.lock().expect("session lock poisoned");
        inner.machine.current() == SessionState::Evicting
            && inner
                .eviction_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Classifies this session as a zombie, if it is one.
    #[must_use]
    pub(crate) fn zombie_reason(&self, pressure_limit: usize) -> Option<&'static str> {
        if self.eviction_deadline_passed() {
            return Some("eviction deadline passed");
        }
        if self.transport.resource_snapshot().listener_count > pressure_limit {
            return Some("unrecoverable listener pressure");
        }
        // A stale claim with sockets still attached is a live session that
        // went quiet, not a crashed holder.
        if self.attached_count() == 0
            && self.mutex.held_by(&self.token)
            && self.mutex.holder_is_stale()
        {
            return Some("stale mutex claim");
        }
        None
    }

    /// Cancels all timers, tears the transport down, releases the radio
    /// claim, and closes every attached socket with `reason`.
    ///
    /// Idempotent; also removes the session from the registry immediately.
    #[instrument(skip(self), level = "info", fields(session = %self.session_id))]
    pub async fn force_cleanup(&self, reason: &str) {
        {
            let mut inner = self.inner.lock().expect("session lock poisoned");
            if inner.closed {
                return;
            }
            inner.closed = true;
            for timer in [
                inner.grace_timer.take(),
                inner.idle_timer.take(),
                inner.eviction_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                timer.cancel();
            }
            match inner.machine.current() {
                SessionState::Active => {
                    let _ = inner.machine.transition(SessionState::Idle, "cleanup complete");
                }
                SessionState::Evicting => {
                    let _ = inner.machine.transition(SessionState::Idle, "cleanup complete");
                }
                SessionState::Idle => {}
            }
        }

        info!(reason, "session cleanup");
        self.cancel.cancel();
        self.transport.disconnect().await;
        if !self.mutex.release(&self.token) {
            debug!(session = %self.session_id, "mutex was not held at cleanup");
        }
        self.shared_state.record_disconnected();
        let _ = self.events_tx.send(SessionEvent::Closed {
            reason: reason.to_string(),
        });
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::time::{Duration, sleep};

    use super::*;
    use crate::ble::{FakeBackend, FakeBackendConfig, FakeBackendHandle, FakeDevice};
    use crate::config::MultipleDevicePolicy;

    fn bridge_config() -> BridgeConfig {
        BridgeConfig {
            grace_period: Duration::from_millis(200),
            idle_timeout: Duration::from_millis(500),
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
        .expect("test config should build")
    }

    fn session_over_fake() -> (Arc<Session>, FakeBackendHandle, Arc<ConnectionMutex>) {
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
        let bridge = bridge_config();
        let mutex = Arc::new(ConnectionMutex::new(bridge.stale_claim_timeout));
        let session = Session::new(
            "s1".to_string(),
            ble_config(),
            Arc::new(backend),
            Arc::new(ScannerGate::new(
                bridge.scanner_recovery_base,
                bridge.scanner_recovery_step,
                bridge.scanner_recovery_cap,
            )),
            &bridge,
            Arc::clone(&mutex),
            Arc::new(PacketLog::new(64)),
            Arc::new(SharedState::default()),
            Weak::new(),
        );
        (session, handle, mutex)
    }

    #[tokio::test]
    async fn first_attach_claims_radio_and_connects() -> anyhow::Result<()> {
        let (session, handle, mutex) = session_over_fake();

        let client = session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(SessionState::Active, session.state());
        assert_eq!(Some("CS108Reader42".to_string()), client.device_name);
        assert!(!mutex.is_free());
        assert_eq!(1, handle.connect_count());
        Ok(())
    }

    #[tokio::test]
    async fn reattach_within_grace_reuses_the_transport() -> anyhow::Result<()> {
        let (session, handle, _mutex) = session_over_fake();

        session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;
        session.detach(1);
        sleep(Duration::from_millis(50)).await;
        session.attach(2).await.map_err(|e| anyhow::anyhow!(e))?;

        assert_eq!(SessionState::Active, session.state());
        assert_eq!(1, handle.scan_count());
        assert_eq!(1, handle.connect_count());
        Ok(())
    }

    #[tokio::test]
    async fn empty_session_past_grace_and_eviction_is_cleaned_up() -> anyhow::Result<()> {
        let (session, _handle, mutex) = session_over_fake();

        session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;
        session.detach(1);
        sleep(Duration::from_millis(600)).await;

        assert!(session.is_closed());
        assert_eq!(SessionState::Idle, session.state());
        assert!(mutex.is_free());
        Ok(())
    }

    #[tokio::test]
    async fn write_outside_active_is_rejected() {
        let (session, _handle, _mutex) = session_over_fake();
        let error = session
            .write(&[0x01])
            .await
            .expect_err("IDLE session should reject writes");
        assert_matches!(error, SessionError::NotActive { .. });
    }

    #[tokio::test]
    async fn writes_reach_the_peripheral_and_the_packet_log() -> anyhow::Result<()> {
        let (session, handle, _mutex) = session_over_fake();
        session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        session
            .write(&[0xA7, 0xB3, 0x02])
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(vec![vec![0xA7, 0xB3, 0x02]], handle.written());
        Ok(())
    }

    #[tokio::test]
    async fn notifications_fan_out_to_attached_sockets() -> anyhow::Result<()> {
        let (session, handle, _mutex) = session_over_fake();
        let mut client = session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        assert!(handle.push_notification(&[0xA7, 0xB3, 0x04]).await);
        loop {
            match client.events.recv().await {
                Ok(SessionEvent::Data(bytes)) => {
                    assert_eq!(vec![0xA7, 0xB3, 0x04], bytes);
                    break;
                }
                Ok(_) => continue,
                Err(error) => panic!("fan-out channel failed: {error}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn link_loss_with_clients_attached_keeps_the_session() -> anyhow::Result<()> {
        let (session, handle, _mutex) = session_over_fake();
        let mut client = session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        handle.drop_link().await;
        loop {
            match client.events.recv().await {
                Ok(SessionEvent::Disconnected) => break,
                Ok(_) => continue,
                Err(error) => panic!("fan-out channel failed: {error}"),
            }
        }
        assert!(!session.is_closed());

        // The next write reconnects lazily.
        session
            .write(&[0x01])
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(2, handle.connect_count());
        Ok(())
    }

    #[tokio::test]
    async fn link_loss_with_no_clients_discards_the_session() -> anyhow::Result<()> {
        let (session, handle, mutex) = session_over_fake();
        session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;
        session.detach(1);

        handle.drop_link().await;
        sleep(Duration::from_millis(50)).await;

        assert!(session.is_closed());
        assert!(mutex.is_free());
        Ok(())
    }

    #[tokio::test]
    async fn idle_timeout_evicts_and_then_cleans_up() -> anyhow::Result<()> {
        let (session, _handle, _mutex) = session_over_fake();
        let mut client = session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        sleep(Duration::from_millis(550)).await;
        assert_eq!(SessionState::Evicting, session.state());

        sleep(Duration::from_millis(250)).await;
        assert!(session.is_closed());
        loop {
            match client.events.recv().await {
                Ok(SessionEvent::Closed { reason }) => {
                    assert_eq!("idle eviction", reason);
                    break;
                }
                Ok(_) => continue,
                Err(error) => panic!("close event missing: {error}"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn activity_during_idle_eviction_resumes_the_session() -> anyhow::Result<()> {
        let (session, _handle, _mutex) = session_over_fake();
        session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        sleep(Duration::from_millis(550)).await;
        assert_eq!(SessionState::Evicting, session.state());

        session
            .write(&[0x01])
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(SessionState::Active, session.state());

        sleep(Duration::from_millis(300)).await;
        assert!(!session.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn attach_during_eviction_is_busy() -> anyhow::Result<()> {
        let (session, _handle, _mutex) = session_over_fake();
        session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        sleep(Duration::from_millis(550)).await;
        assert_eq!(SessionState::Evicting, session.state());

        let error = session
            .attach(2)
            .await
            .expect_err("EVICTING session should reject attach");
        assert_matches!(error, SessionError::Busy);
        Ok(())
    }

    #[tokio::test]
    async fn force_cleanup_is_idempotent_and_releases_everything() -> anyhow::Result<()> {
        let (session, _handle, mutex) = session_over_fake();
        let mut client = session.attach(1).await.map_err(|e| anyhow::anyhow!(e))?;

        session.force_cleanup("client request").await;
        session.force_cleanup("client request").await;

        assert!(session.is_closed());
        assert!(mutex.is_free());
        loop {
            match client.events.recv().await {
                Ok(SessionEvent::Closed { reason }) => {
                    assert_eq!("client request", reason);
                    break;
                }
                Ok(_) => continue,
                Err(error) => panic!("close event missing: {error}"),
            }
        }
        Ok(())
    }
}
