use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::ble::{BleBackend, BtleplugBackend, FakeBackend, FakeBackendConfig};
use crate::cli::Args;
use crate::config::BridgeConfig;
use crate::log_stream::{PacketLog, SharedState};
use crate::server::{ServerContext, run_server};
use crate::session::SessionManager;
use crate::telemetry;

/// A running bridge: the bound address plus the handles needed to stop it.
pub struct BridgeHandle {
    pub local_addr: SocketAddr,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl BridgeHandle {
    /// Stops accepting, force-cleans every session, and waits for the
    /// accept loop to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.manager.stop_all().await;
        let _ = self.server.await;
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }
}

/// Binds the listener and starts serving against an injected backend.
///
/// Embedders and tests call this directly; the binary goes through [`run`].
///
/// # Errors
///
/// Returns an error when the listen address cannot be bound.
pub async fn start(config: BridgeConfig, backend: Arc<dyn BleBackend>) -> Result<BridgeHandle> {
    let packet_log = Arc::new(PacketLog::new(config.packet_log_capacity));
    let shared_state = Arc::new(SharedState::default());
    let manager = SessionManager::new(
        config.clone(),
        backend,
        Arc::clone(&packet_log),
        Arc::clone(&shared_state),
    );
    manager.spawn_sweeper();

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let context = ServerContext {
        manager: Arc::clone(&manager),
        packet_log,
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let server = tokio::spawn(run_server(listener, context));

    Ok(BridgeHandle {
        local_addr,
        manager,
        shutdown,
        server,
    })
}

/// Runs the bridge with already parsed arguments until Ctrl-C.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the backend cannot be
/// created, or the listener cannot be bound.
pub async fn run(args: Args) -> Result<()> {
    telemetry::initialise_tracing(args.log_level().or_else(BridgeConfig::log_level_from_env))?;

    let mut config = BridgeConfig::from_env();
    if let Some(bind) = args.bind() {
        config.bind_addr = bind;
    }
    if let Some(grace) = args.grace_period() {
        config.grace_period = grace;
    }
    if let Some(idle) = args.idle_timeout() {
        config.idle_timeout = idle;
    }

    let backend: Arc<dyn BleBackend> = if args.fake() {
        let devices = args.fake_devices().map_err(anyhow::Error::msg)?;
        Arc::new(FakeBackend::new(
            FakeBackendConfig::builder().devices(devices).build(),
        ))
    } else {
        Arc::new(BtleplugBackend::new().await?)
    };

    let handle = start(config, backend).await?;
    info!(addr = %handle.local_addr, "bridge started");

    tokio::signal::ctrl_c()
        .await
        .context("failed while waiting for Ctrl+C")?;
    info!("Ctrl+C received; shutting down");
    handle.shutdown().await;
    Ok(())
}
