use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection_mutex::ConnectionMutex;
use super::session::Session;
use super::state::SessionState;
use crate::ble::{BleBackend, ScannerGate};
use crate::config::{BleConfig, BridgeConfig};
use crate::error::SessionError;
use crate::log_stream::{PacketLog, SharedState};

/// Listener pressure beyond which a session is unrecoverable.
const LISTENER_PRESSURE_ZOMBIE_LIMIT: usize = 100;

/// The keyed session map; the only cross-session shared structure.
///
/// Sessions hold a weak handle back here so terminal cleanup can release
/// their entry immediately.
pub(crate) struct Registry {
    entries: Mutex<HashMap<String, Arc<Session>>>,
}

impl Registry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    fn insert(&self, session: Arc<Session>) {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .insert(session.session_id().to_string(), session);
    }

    pub(crate) fn remove(&self, session_id: &str) {
        let removed = self
            .entries
            .lock()
            .expect("registry lock poisoned")
            .remove(session_id);
        if removed.is_some() {
            debug!(session = session_id, "session removed from registry");
        }
    }

    fn values(&self) -> Vec<Arc<Session>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }
}

/// Keyed registry of sessions: creates, reuses, evicts, sweeps.
pub struct SessionManager {
    registry: Arc<Registry>,
    backend: Arc<dyn BleBackend>,
    gate: Arc<ScannerGate>,
    mutex: Arc<ConnectionMutex>,
    config: BridgeConfig,
    packet_log: Arc<PacketLog>,
    shared_state: Arc<SharedState>,
    shutdown: CancellationToken,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        backend: Arc<dyn BleBackend>,
        packet_log: Arc<PacketLog>,
        shared_state: Arc<SharedState>,
    ) -> Arc<Self> {
        let gate = Arc::new(ScannerGate::new(
            config.scanner_recovery_base,
            config.scanner_recovery_step,
            config.scanner_recovery_cap,
        ));
        let mutex = Arc::new(ConnectionMutex::new(config.stale_claim_timeout));
        Arc::new_cyclic(|weak| Self {
            registry: Registry::new(),
            backend,
            gate,
            mutex,
            config,
            packet_log,
            shared_state,
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        })
    }

    /// Starts the periodic zombie sweep; runs until [`Self::stop_all`].
    pub fn spawn_sweeper(&self) {
        let weak = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        let sweep_interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.sweep().await;
                    }
                }
            }
        });
    }

    /// Resolves the session for a key, creating one when absent.
    ///
    /// An existing compatible entry is reused. An incompatible entry that
    /// still has sockets attached is busy; an unattached one is evicted and
    /// replaced (the connection mutex stays the ultimate arbiter for the
    /// newcomer's first attach).
    ///
    /// Never awaits BLE.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] when a different live configuration
    /// holds the key.
    #[instrument(skip(self, config), level = "debug")]
    pub fn get_or_create(
        &self,
        session_id: Option<String>,
        config: BleConfig,
    ) -> Result<Arc<Session>, SessionError> {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = self.registry.get(&session_id) {
            if existing.is_closed() {
                self.registry.remove(&session_id);
            } else if existing.config().is_compatible_with(&config) {
                return Ok(existing);
            } else if existing.attached_count() == 0 {
                info!(session = %session_id, "evicting unattached session for a new configuration");
                self.registry.remove(&session_id);
                tokio::spawn(async move {
                    existing.force_cleanup("evicted for new configuration").await;
                });
            } else {
                return Err(SessionError::Busy);
            }
        }

        let session = Session::new(
            session_id,
            config,
            Arc::clone(&self.backend),
            Arc::clone(&self.gate),
            &self.config,
            Arc::clone(&self.mutex),
            Arc::clone(&self.packet_log),
            Arc::clone(&self.shared_state),
            Arc::downgrade(&self.registry),
        );
        self.registry.insert(Arc::clone(&session));
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry.get(session_id)
    }

    /// Drops a just-created entry whose first attach never succeeded.
    pub fn discard_if_unattached(&self, session_id: &str) {
        if let Some(session) = self.registry.get(session_id)
            && session.attached_count() == 0
            && session.state() == SessionState::Idle
        {
            self.registry.remove(session_id);
            tokio::spawn(async move {
                session.force_cleanup("attach failed").await;
            });
        }
    }

    /// One zombie-classification pass over every session.
    ///
    /// Eviction order is deterministic: oldest EVICTING entries first, ties
    /// broken by earliest last activity.
    pub async fn sweep(&self) {
        let mut zombies: Vec<(Arc<Session>, &'static str)> = self
            .registry
            .values()
            .into_iter()
            .filter_map(|session| {
                session
                    .zombie_reason(LISTENER_PRESSURE_ZOMBIE_LIMIT)
                    .map(|reason| (session, reason))
            })
            .collect();

        zombies.sort_by_key(|(session, _)| {
            (
                session.evicting_since().is_none(),
                session.evicting_since(),
                session.last_activity(),
            )
        });

        for (session, reason) in zombies {
            warn!(session = %session.session_id(), reason, "sweep classified session as zombie");
            session.force_cleanup("zombie cleanup").await;
        }
    }

    /// Force-cleans every session; used on process shutdown.
    pub async fn stop_all(&self) {
        self.shutdown.cancel();
        for session in self.registry.values() {
            session.force_cleanup("shutdown").await;
        }
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.registry.values()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.registry.len()
    }
}
