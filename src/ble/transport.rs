use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::{BleBackend, BleLink, DiscoveredDevice, LinkEvent, ResourceSnapshot, ScanSelector};
use crate::config::{BleConfig, MultipleDevicePolicy};
use crate::error::ConnectError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const LISTENER_PRESSURE_THRESHOLDS: [usize; 5] = [5, 10, 25, 50, 100];
const LISTENERS_PER_DELAY_STEP: usize = 5;

/// Radio-side connection state.
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum TransportState {
    #[display("DISCONNECTED")]
    Disconnected,
    #[display("CONNECTING")]
    Connecting,
    #[display("CONNECTED")]
    Connected,
    #[display("DISCONNECTING")]
    Disconnecting,
}

/// Events a transport surfaces to its owning session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Notification bytes, in radio delivery order.
    Data(Vec<u8>),
    /// The peripheral link dropped; the transport is already DISCONNECTED.
    Disconnected,
}

/// Process-wide gate between a scanner teardown and the next scan start.
///
/// Restarting a scan too soon after stopping one leaves the native stack in
/// an unscannable state; listener pressure on the stack makes the required
/// gap longer.
pub struct ScannerGate {
    base: Duration,
    step: Duration,
    cap: Duration,
    last_teardown: Mutex<Option<Instant>>,
}

impl ScannerGate {
    #[must_use]
    pub fn new(base: Duration, step: Duration, cap: Duration) -> Self {
        Self {
            base,
            step,
            cap,
            last_teardown: Mutex::new(None),
        }
    }

    /// The enforced gap for a given listener pressure.
    #[must_use]
    pub fn effective_delay(&self, listener_count: usize) -> Duration {
        let extra = self
            .step
            .saturating_mul((listener_count / LISTENERS_PER_DELAY_STEP) as u32);
        self.base.saturating_add(extra).min(self.cap)
    }

    /// Sleeps until the recovery gap since the last teardown has elapsed.
    pub async fn wait_ready(&self, listener_count: usize) {
        if let Some(threshold) = LISTENER_PRESSURE_THRESHOLDS
            .iter()
            .rev()
            .find(|threshold| listener_count > **threshold)
        {
            warn!(
                listener_count,
                threshold, "listener pressure extends scanner-recovery delay"
            );
        }

        let delay = self.effective_delay(listener_count);
        let ready_at = {
            let last = self.last_teardown.lock().expect("scanner gate lock poisoned");
            last.map(|instant| instant + delay)
        };
        if let Some(ready_at) = ready_at {
            let now = Instant::now();
            if ready_at > now {
                debug!(wait_ms = (ready_at - now).as_millis() as u64, "waiting out scanner recovery");
                sleep(ready_at - now).await;
            }
        }
    }

    /// Records a scanner teardown instant.
    pub fn record_teardown(&self) {
        *self
            .last_teardown
            .lock()
            .expect("scanner gate lock poisoned") = Some(Instant::now());
    }
}

/// The radio-side worker owned by one session.
///
/// All mutation goes through the state mutex or the link mutex; the link
/// mutex also serializes writes, which gives each session a total TX order.
pub struct BleTransport {
    backend: Arc<dyn BleBackend>,
    gate: Arc<ScannerGate>,
    scan_deadline: Duration,
    multi_device_settle: Duration,
    state: Mutex<TransportState>,
    link: tokio::sync::Mutex<Option<Box<dyn BleLink>>>,
    device_name: Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    weak_self: Weak<BleTransport>,
}

impl BleTransport {
    #[must_use]
    pub fn new(
        backend: Arc<dyn BleBackend>,
        gate: Arc<ScannerGate>,
        scan_deadline: Duration,
        multi_device_settle: Duration,
        events_tx: mpsc::UnboundedSender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            backend,
            gate,
            scan_deadline,
            multi_device_settle,
            state: Mutex::new(TransportState::Disconnected),
            link: tokio::sync::Mutex::new(None),
            device_name: Mutex::new(None),
            events_tx,
            cancel,
            weak_self: weak.clone(),
        })
    }

    /// Atomically moves DISCONNECTED to CONNECTING.
    ///
    /// Returns false when a connect attempt is already in flight or the link
    /// is already up.
    #[must_use]
    pub fn try_claim_connection(&self) -> bool {
        let mut state = self.state.lock().expect("transport state lock poisoned");
        if *state == TransportState::Disconnected {
            *state = TransportState::Connecting;
            true
        } else {
            false
        }
    }

    /// Runs the full connect sequence; valid only in CONNECTING.
    ///
    /// Powered-on wait, scanner-recovery gap, bounded scan with the
    /// multiple-device policy, connect, characteristic resolution, notify
    /// subscription. Any failure drives the transport back to DISCONNECTED
    /// and returns a typed error; retries belong to the session layer.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] naming the failed step.
    #[instrument(skip(self, config), level = "debug", fields(service = %config.service))]
    pub async fn connect(&self, config: &BleConfig) -> Result<(), ConnectError> {
        {
            let state = self.state.lock().expect("transport state lock poisoned");
            if *state != TransportState::Connecting {
                return Err(ConnectError::ConnectFailed {
                    device: config.device_prefix.clone().unwrap_or_default(),
                    detail: format!("connect requires CONNECTING, transport is {state}"),
                });
            }
        }

        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(ConnectError::Cancelled),
            result = self.connect_inner(config) => result,
        };

        if let Err(error) = &result {
            debug!(%error, "connect attempt failed");
            self.set_state(TransportState::Disconnected);
        }
        result
    }

    async fn connect_inner(&self, config: &BleConfig) -> Result<(), ConnectError> {
        self.backend.wait_powered_on(config.connect_timeout).await?;

        let pressure = self.backend.resource_snapshot().listener_count;
        self.gate.wait_ready(pressure).await;

        let timeout_ms = config.connect_timeout.as_millis() as u64;
        let connected = timeout(config.connect_timeout, async {
            let device = self.scan_for_match(config).await?;
            let link = self.backend.connect(&device.id, config).await?;
            let events = match link.subscribe().await {
                Ok(events) => events,
                Err(error) => {
                    if let Err(cleanup_error) = link.disconnect().await {
                        debug!(?cleanup_error, "failed to disconnect after subscribe failure");
                    }
                    return Err(error);
                }
            };
            Ok::<_, ConnectError>((link, events))
        })
        .await
        .map_err(|_elapsed| ConnectError::ConnectDeadline { timeout_ms })??;

        let (link, events) = connected;
        let name = link.device_name();
        *self.device_name.lock().expect("transport name lock poisoned") = name.clone();
        *self.link.lock().await = Some(link);
        self.set_state(TransportState::Connected);
        info!(device = ?name, "transport connected");

        self.spawn_event_pump(events);
        Ok(())
    }

    /// Polls the scan until the selector matches, honoring the
    /// multiple-device policy, then stops the scanner regardless of outcome.
    async fn scan_for_match(&self, config: &BleConfig) -> Result<DiscoveredDevice, ConnectError> {
        let selector = ScanSelector::from_config(config);
        self.backend.start_scan().await?;

        let result = self.poll_for_match(&selector, config.on_multiple_devices).await;

        if let Err(error) = self.backend.stop_scan().await {
            debug!(?error, "failed to stop scan cleanly");
        }
        self.gate.record_teardown();
        result
    }

    async fn poll_for_match(
        &self,
        selector: &ScanSelector,
        policy: MultipleDevicePolicy,
    ) -> Result<DiscoveredDevice, ConnectError> {
        let deadline = Instant::now() + self.scan_deadline;
        let mut candidate: Option<DiscoveredDevice> = None;
        let mut settle_until: Option<Instant> = None;

        loop {
            let matches: Vec<DiscoveredDevice> = self
                .backend
                .discovered()
                .await?
                .into_iter()
                .filter(|device| selector.matches(device))
                .collect();

            match policy {
                MultipleDevicePolicy::First => {
                    if let Some(device) = matches.into_iter().next() {
                        return Ok(device);
                    }
                }
                MultipleDevicePolicy::Error => {
                    if matches.len() > 1 {
                        return Err(ConnectError::MultipleDevices {
                            count: matches.len(),
                        });
                    }
                    if let Some(device) = matches.into_iter().next() {
                        match &candidate {
                            Some(existing) if existing.id != device.id => {
                                return Err(ConnectError::MultipleDevices { count: 2 });
                            }
                            Some(_) => {}
                            None => {
                                candidate = Some(device);
                                settle_until =
                                    Some((Instant::now() + self.multi_device_settle).min(deadline));
                            }
                        }
                    }
                    if let (Some(device), Some(until)) = (&candidate, settle_until)
                        && Instant::now() >= until
                    {
                        return Ok(device.clone());
                    }
                }
            }

            if Instant::now() >= deadline {
                return match candidate {
                    Some(device) => Ok(device),
                    None => Err(ConnectError::ScanTimeout),
                };
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    fn spawn_event_pump(&self, mut events: mpsc::Receiver<LinkEvent>) {
        let transport = self.weak_self.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    maybe_event = events.recv() => {
                        let Some(transport) = transport.upgrade() else { break };
                        match maybe_event {
                            Some(LinkEvent::Notification(bytes)) => {
                                if transport.events_tx.send(TransportEvent::Data(bytes)).is_err() {
                                    break;
                                }
                            }
                            Some(LinkEvent::Disconnected) | None => {
                                transport.mark_link_lost().await;
                                let _ = transport.events_tx.send(TransportEvent::Disconnected);
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Peripheral-initiated link loss: clear the link without the usual
    /// teardown choreography (nothing is left to unsubscribe from).
    async fn mark_link_lost(&self) {
        self.link.lock().await.take();
        *self.device_name.lock().expect("transport name lock poisoned") = None;
        self.set_state(TransportState::Disconnected);
        info!("peripheral link lost");
    }

    /// Writes without response; valid only in CONNECTED.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::NotConnected`] when no link is up, or the
    /// backend's write error.
    pub async fn write(&self, payload: &[u8]) -> Result<(), ConnectError> {
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => link.write(payload).await,
            None => Err(ConnectError::NotConnected),
        }
    }

    /// Deterministic teardown: unsubscribe, disconnect the peripheral,
    /// clear references. Idempotent; each step's failure is logged and the
    /// terminal DISCONNECTED state is guaranteed.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().expect("transport state lock poisoned");
            if matches!(
                *state,
                TransportState::Disconnected | TransportState::Disconnecting
            ) {
                return;
            }
            *state = TransportState::Disconnecting;
        }

        if let Some(link) = self.link.lock().await.take() {
            if let Err(error) = link.unsubscribe().await {
                debug!(?error, "failed to unsubscribe during teardown");
            }
            if let Err(error) = link.disconnect().await {
                debug!(?error, "failed to disconnect peripheral during teardown");
            }
        }
        *self.device_name.lock().expect("transport name lock poisoned") = None;
        self.set_state(TransportState::Disconnected);
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state.lock().expect("transport state lock poisoned")
    }

    #[must_use]
    pub fn device_name(&self) -> Option<String> {
        self.device_name
            .lock()
            .expect("transport name lock poisoned")
            .clone()
    }

    /// Listener/peripheral bookkeeping used by the zombie detector.
    #[must_use]
    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        self.backend.resource_snapshot()
    }

    fn set_state(&self, next: TransportState) {
        *self.state.lock().expect("transport state lock poisoned") = next;
    }
}
