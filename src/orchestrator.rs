//! Top-level routing control.
//!
//! [`Orchestrator`] picks daemon-backed or proxy-chain routing per mode, owns
//! the single active daemon, bridge and chain, and is the one place that
//! decides on retries. Only one `start`, `stop` or `rotate_chain` runs at a
//! time; overlapping calls are rejected with [`OrchestratorError::Busy`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

use crate::bridge::{BridgeError, TunnelBridge};
use crate::chain::{
    ChainConnector, ChainError, ChainRelay, ChainStatus, ChainSupervisor, Dialer, Mode, ProxyHop,
    SupervisorSettings,
};
use crate::config::Config;
use crate::daemon::{DaemonError, DaemonHandle, DaemonProcess, DaemonState};
use crate::events::{EventSink, VeilEvent};
use crate::process::{ExecutableLocator, ProcessLauncher};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("another start, stop or rotation is in progress")]
    Busy,
    #[error("routing is already active ({0})")]
    AlreadyRunning(Mode),
    #[error("routing is not active")]
    NotRunning,
    #[error("standard tunnel rejected: {0}")]
    TunnelRejected(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Bridge(BridgeError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("relay error: {0}")]
    Relay(#[source] std::io::Error),
}

impl From<BridgeError> for OrchestratorError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::PermissionDenied(msg) => OrchestratorError::PermissionDenied(msg),
            other => OrchestratorError::Bridge(other),
        }
    }
}

/// The platform's pre-existing tunnel (e.g. WireGuard), used as a black box.
#[async_trait]
pub trait StandardTunnel: Send + Sync {
    async fn connect(&self, config: &str) -> bool;
}

/// Virtual interface handed over by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelInterface {
    pub fd: i32,
    pub mtu: u32,
}

#[derive(Debug, Clone)]
pub struct StartParams {
    pub mode: Mode,
    pub use_bridges: bool,
    /// Bridge this interface into the active route.
    pub tunnel: Option<TunnelInterface>,
    /// Daemon-backed only: also bring up the standard tunnel with this config.
    pub standard_tunnel_config: Option<String>,
}

impl StartParams {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            use_bridges: false,
            tunnel: None,
            standard_tunnel_config: None,
        }
    }
}

/// Active chain, as reported by [`Orchestrator::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainSummary {
    pub id: uuid::Uuid,
    pub route: String,
    pub hops: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    pub mode: Option<Mode>,
    pub busy: bool,
    pub bootstrap_percent: u8,
    /// `None` while a daemon operation holds the daemon.
    pub daemon: Option<DaemonHandle>,
    pub chain_status: ChainStatus,
    pub chain: Option<ChainSummary>,
    pub relay_addr: Option<SocketAddr>,
    pub bridge_pid: Option<u32>,
}

/// Everything the orchestrator drives.
pub struct OrchestratorParts {
    pub daemon: DaemonProcess,
    pub bridge: TunnelBridge,
    pub connector: ChainConnector,
    pub supervisor_settings: SupervisorSettings,
    pub pool: Vec<ProxyHop>,
    pub retry_with_bridges: bool,
    /// Where the chain relay listens (port 0 picks a free port).
    pub relay_addr: SocketAddr,
}

/// Resets the in-flight flag when the operation ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    daemon: Mutex<DaemonProcess>,
    bootstrap: watch::Receiver<u8>,
    bridge: Mutex<TunnelBridge>,
    supervisor: ChainSupervisor,
    relay: Mutex<Option<ChainRelay>>,
    relay_addr: SocketAddr,
    pool: Mutex<Vec<ProxyHop>>,
    standard_tunnel: Option<Arc<dyn StandardTunnel>>,
    retry_with_bridges: bool,
    events: EventSink,
    in_flight: AtomicBool,
    mode: Mutex<Option<Mode>>,
}

impl Orchestrator {
    /// Create the orchestrator and the receiving end of its event stream.
    pub fn new(parts: OrchestratorParts) -> (Self, mpsc::UnboundedReceiver<VeilEvent>) {
        let (events, rx) = EventSink::channel();
        let supervisor =
            ChainSupervisor::new(parts.connector, parts.supervisor_settings, events.clone());
        let orchestrator = Self {
            bootstrap: parts.daemon.bootstrap_watch(),
            daemon: Mutex::new(parts.daemon),
            bridge: Mutex::new(parts.bridge),
            supervisor,
            relay: Mutex::new(None),
            relay_addr: parts.relay_addr,
            pool: Mutex::new(parts.pool),
            standard_tunnel: None,
            retry_with_bridges: parts.retry_with_bridges,
            events,
            in_flight: AtomicBool::new(false),
            mode: Mutex::new(None),
        };
        (orchestrator, rx)
    }

    /// Wire everything up from configuration.
    pub fn from_config(
        config: &Config,
        launcher: Arc<dyn ProcessLauncher>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<VeilEvent>), ChainError> {
        let locator = ExecutableLocator::new(config.install_layout());
        let parts = OrchestratorParts {
            daemon: DaemonProcess::new(launcher.clone(), locator.clone(), config.daemon_settings()),
            bridge: TunnelBridge::new(launcher, locator, config.bridge_settings()),
            connector: ChainConnector::new(dialer)
                .with_connect_timeout(config.connect_timeout())
                .with_delay(config.hop_delay()),
            supervisor_settings: config.supervisor_settings(),
            pool: config.server_pool()?,
            retry_with_bridges: config.daemon.retry_with_bridges,
            relay_addr: SocketAddr::from(([127, 0, 0, 1], config.chain.relay_port)),
        };
        Ok(Self::new(parts))
    }

    pub fn with_standard_tunnel(mut self, tunnel: Arc<dyn StandardTunnel>) -> Self {
        self.standard_tunnel = Some(tunnel);
        self
    }

    /// Replace the candidate pool used by the next chain start.
    pub async fn set_pool(&self, pool: Vec<ProxyHop>) {
        *self.pool.lock().await = pool;
    }

    pub fn supervisor(&self) -> &ChainSupervisor {
        &self.supervisor
    }

    fn begin(&self) -> Result<InFlight<'_>, OrchestratorError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| InFlight(&self.in_flight))
            .map_err(|_| OrchestratorError::Busy)
    }

    /// Bring up routing for `params.mode`. On failure everything opened so far
    /// is torn down before the error is returned.
    pub async fn start(&self, params: StartParams) -> Result<(), OrchestratorError> {
        let _guard = self.begin()?;
        if let Some(active) = *self.mode.lock().await {
            return Err(OrchestratorError::AlreadyRunning(active));
        }

        info!("Starting {} routing", params.mode);
        let result = if params.mode.uses_chain() {
            self.start_chain(&params).await
        } else {
            self.start_daemon(&params).await
        };

        match result {
            Ok(()) => {
                *self.mode.lock().await = Some(params.mode);
                Ok(())
            }
            Err(e) => {
                warn!("Start failed: {}", e);
                self.events.error(e.to_string());
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn start_daemon(&self, params: &StartParams) -> Result<(), OrchestratorError> {
        let socks_addr = {
            let mut daemon = self.daemon.lock().await;
            let can_retry =
                !params.use_bridges && self.retry_with_bridges && daemon.has_usable_bridges();
            match self.launch_daemon(&mut daemon, params.use_bridges).await {
                Err(DaemonError::BootstrapTimeout { .. }) if can_retry => {
                    warn!("Bootstrap timed out, retrying with bridges");
                    self.launch_daemon(&mut daemon, true).await?;
                }
                other => other?,
            }
            daemon.socks_addr()
        };

        if let Some(config) = &params.standard_tunnel_config {
            let tunnel = self.standard_tunnel.as_ref().ok_or_else(|| {
                OrchestratorError::TunnelRejected("no standard tunnel available".into())
            })?;
            if !tunnel.connect(config).await {
                return Err(OrchestratorError::TunnelRejected(
                    "connect returned false".into(),
                ));
            }
            info!("Standard tunnel connected");
        }

        if let Some(tun) = params.tunnel {
            self.start_bridge(tun, socks_addr).await?;
        }
        Ok(())
    }

    async fn launch_daemon(
        &self,
        daemon: &mut DaemonProcess,
        use_bridges: bool,
    ) -> Result<(), DaemonError> {
        self.events.emit(VeilEvent::DaemonState {
            state: DaemonState::Starting,
        });
        let events = self.events.clone();
        let result = daemon
            .start(use_bridges, move |percent| {
                events.emit(VeilEvent::DaemonProgress { percent })
            })
            .await;
        self.events.emit(VeilEvent::DaemonState {
            state: daemon.state(),
        });
        result
    }

    async fn start_chain(&self, params: &StartParams) -> Result<(), OrchestratorError> {
        let pool = self.pool.lock().await.clone();
        self.supervisor.start(params.mode, pool).await?;

        if let Some(tun) = params.tunnel {
            let relay = ChainRelay::bind(self.relay_addr, self.supervisor.clone())
                .await
                .map_err(OrchestratorError::Relay)?;
            let relay_addr = relay.local_addr();
            *self.relay.lock().await = Some(relay);
            self.start_bridge(tun, relay_addr).await?;
        }
        Ok(())
    }

    async fn start_bridge(
        &self,
        tun: TunnelInterface,
        socks_addr: SocketAddr,
    ) -> Result<(), OrchestratorError> {
        let mut bridge = self.bridge.lock().await;
        bridge.start(tun.fd, socks_addr, tun.mtu).await?;
        self.events.emit(VeilEvent::BridgeStarted { pid: bridge.pid() });
        Ok(())
    }

    /// Tear down whatever is running. Safe to call when nothing is.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let _guard = self.begin()?;
        self.teardown().await;
        Ok(())
    }

    async fn teardown(&self) {
        {
            let mut bridge = self.bridge.lock().await;
            if bridge.pid().is_some() {
                bridge.stop().await;
                self.events.emit(VeilEvent::BridgeStopped);
            }
        }
        if let Some(mut relay) = self.relay.lock().await.take() {
            relay.stop().await;
        }
        if self.supervisor.status() != ChainStatus::Inactive {
            self.supervisor.stop().await;
        }
        {
            let mut daemon = self.daemon.lock().await;
            if daemon.state() != DaemonState::Idle {
                daemon.stop().await;
                self.events.emit(VeilEvent::DaemonState {
                    state: daemon.state(),
                });
            }
        }
        if let Some(mode) = self.mode.lock().await.take() {
            info!("{} routing stopped", mode);
        }
    }

    /// New identity: a full chain rebuild, or a fresh daemon circuit.
    ///
    /// A failed chain rebuild leaves nothing to route through, so the relay
    /// and bridge are torn down with it and routing returns to inactive.
    pub async fn rotate_chain(&self) -> Result<(), OrchestratorError> {
        let _guard = self.begin()?;
        let mode = (*self.mode.lock().await).ok_or(OrchestratorError::NotRunning)?;

        if mode.uses_chain() {
            if let Err(e) = self.supervisor.rotate(true).await {
                warn!("Rotation failed, stopping {} routing: {}", mode, e);
                self.events.error(e.to_string());
                self.teardown().await;
                return Err(e.into());
            }
        } else {
            let exit_country = self.daemon.lock().await.request_new_circuit().await?;
            self.events.emit(VeilEvent::CircuitRenewed { exit_country });
        }
        Ok(())
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let daemon = self.daemon.try_lock().ok().map(|d| d.handle());
        let chain = self.supervisor.active_chain().await.map(|c| ChainSummary {
            id: c.id(),
            route: c.describe(),
            hops: c.len(),
            created_at: c.created_at(),
        });
        let relay_addr = self.relay.lock().await.as_ref().map(|r| r.local_addr());
        let bridge_pid = self.bridge.try_lock().ok().and_then(|b| b.pid());

        OrchestratorStatus {
            mode: *self.mode.lock().await,
            busy: self.in_flight.load(Ordering::Acquire),
            bootstrap_percent: *self.bootstrap.borrow(),
            daemon,
            chain_status: self.supervisor.status(),
            chain,
            relay_addr,
            bridge_pid,
        }
    }
}
