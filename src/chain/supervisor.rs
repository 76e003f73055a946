//! Active chain lifecycle: connect, heartbeat, rotation and teardown.

use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::connector::close_connections;
use super::transport::ProxyConnection;
use super::{Chain, ChainBuilder, ChainConnector, ChainError, ChainStatus, Mode, ProxyHop};
use crate::events::{EventSink, VeilEvent};

/// Timer settings for a supervised chain.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    pub rotation_interval: Duration,
    pub paranoid_rotation_interval: Duration,
    /// Bound on waiting for background tasks to observe cancellation.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            rotation_interval: Duration::from_secs(600),
            paranoid_rotation_interval: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

struct ActiveChain {
    chain: Chain,
    pool: Vec<ProxyHop>,
    connections: Vec<ProxyConnection>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    connector: ChainConnector,
    settings: SupervisorSettings,
    events: EventSink,
    /// Serialises start, rotate and stop.
    op: Mutex<()>,
    active: Mutex<Option<ActiveChain>>,
    background: Mutex<Option<Background>>,
    status: watch::Sender<ChainStatus>,
}

/// Owns at most one live chain.
///
/// Cloning yields another handle to the same supervisor. Background tasks
/// hold only weak references, so dropping every handle ends them too.
#[derive(Clone)]
pub struct ChainSupervisor {
    inner: Arc<Inner>,
}

impl ChainSupervisor {
    pub fn new(connector: ChainConnector, settings: SupervisorSettings, events: EventSink) -> Self {
        let (status, _) = watch::channel(ChainStatus::Inactive);
        Self {
            inner: Arc::new(Inner {
                connector,
                settings,
                events,
                op: Mutex::new(()),
                active: Mutex::new(None),
                background: Mutex::new(None),
                status,
            }),
        }
    }

    pub fn status(&self) -> ChainStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainStatus> {
        self.inner.status.subscribe()
    }

    pub fn connector(&self) -> &ChainConnector {
        &self.inner.connector
    }

    /// Descriptor of the live chain, if any.
    pub async fn active_chain(&self) -> Option<Chain> {
        self.inner.active.lock().await.as_ref().map(|a| a.chain.clone())
    }

    /// Build and connect a chain for `mode` from `pool`, then start the
    /// heartbeat and (for rotating modes) the rotation timer.
    pub async fn start(&self, mode: Mode, pool: Vec<ProxyHop>) -> Result<Chain, ChainError> {
        let _op = self.inner.op.lock().await;
        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            return Err(ChainError::AlreadyActive);
        }

        self.set_status(ChainStatus::Connecting);
        let chain = match self.build_and_connect(mode, &pool, None).await {
            Ok((chain, connections)) => {
                *active = Some(ActiveChain {
                    chain: chain.clone(),
                    pool,
                    connections,
                });
                chain
            }
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        drop(active);

        self.spawn_background(mode).await;
        self.set_status(ChainStatus::Connected);
        self.announce(&chain);
        Ok(chain)
    }

    /// Replace the chain. A full rotation tears the chain down and builds a
    /// fresh one; otherwise only the exit is swapped, connecting the new path
    /// before the old one is closed.
    pub async fn rotate(&self, full: bool) -> Result<Chain, ChainError> {
        let _op = self.inner.op.lock().await;
        let mut slot = self.inner.active.lock().await;
        let current = slot.take().ok_or(ChainError::NotActive)?;

        self.set_status(ChainStatus::Rotating);
        let mode = current.chain.mode();
        let pool = current.pool;

        let result = if full {
            info!("Rotating full {} chain {}", mode, current.chain.id());
            close_connections(current.connections).await;
            self.build_and_connect(mode, &pool, None).await
        } else {
            info!("Rotating exit of chain {}", current.chain.id());
            let result = self
                .build_and_connect(mode, &pool, Some(&current.chain))
                .await;
            close_connections(current.connections).await;
            result
        };

        match result {
            Ok((chain, connections)) => {
                *slot = Some(ActiveChain {
                    chain: chain.clone(),
                    pool,
                    connections,
                });
                drop(slot);
                self.set_status(ChainStatus::Connected);
                self.announce(&chain);
                Ok(chain)
            }
            Err(e) => {
                drop(slot);
                self.fail(&e);
                self.signal_background().await;
                Err(e)
            }
        }
    }

    /// Cancel timers, close every connection and return to `Inactive`.
    /// Safe to call repeatedly.
    pub async fn stop(&self) {
        // Signal first: a scheduled rotation holding the op lock abandons its
        // attempt once it sees the signal.
        self.join_background().await;

        let _op = self.inner.op.lock().await;
        let active = self.inner.active.lock().await.take();
        if let Some(active) = active {
            info!("Stopping chain {}", active.chain.id());
            close_connections(active.connections).await;
        }
        self.set_status(ChainStatus::Inactive);
    }

    /// Check the live chain link. Returns `None` when there is no chain or
    /// a rotation holds it.
    pub(crate) async fn heartbeat(&self) -> Option<bool> {
        // Mid-rotation when the lock is taken
        let mut slot = self.inner.active.try_lock().ok()?;
        let active = slot.as_mut()?;
        let entry = active.chain.entry().clone();
        let link = active
            .connections
            .iter_mut()
            .rev()
            .find(|c| c.owns_stream())?;

        match link.check_link().await? {
            Ok(()) => {
                debug!("Heartbeat ok for chain via {}", entry.address());
                Some(true)
            }
            Err(e) => {
                warn!("Heartbeat failed for entry {}: {}", entry.address(), e);
                self.inner.events.emit(VeilEvent::HeartbeatFailed {
                    hop_id: entry.id.clone(),
                    error: e.to_string(),
                });
                Some(false)
            }
        }
    }

    async fn build_and_connect(
        &self,
        mode: Mode,
        pool: &[ProxyHop],
        replace_exit_of: Option<&Chain>,
    ) -> Result<(Chain, Vec<ProxyConnection>), ChainError> {
        let chain = {
            let mut rng = StdRng::from_entropy();
            match replace_exit_of {
                Some(current) => ChainBuilder::replace_exit(current, pool, &mut rng)?,
                None => ChainBuilder::build(mode, pool, &mut rng)?,
            }
        };
        let connections = self.inner.connector.connect(&chain).await?;
        Ok((chain, connections))
    }

    async fn spawn_background(&self, mode: Mode) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let settings = &self.inner.settings;
        let mut handles = vec![tokio::spawn(heartbeat_loop(
            Arc::downgrade(&self.inner),
            settings.heartbeat_interval,
            shutdown_rx.clone(),
        ))];

        if let Some(interval) =
            mode.rotation_interval(settings.rotation_interval, settings.paranoid_rotation_interval)
        {
            debug!("Rotating {} chains every {}s", mode, interval.as_secs());
            handles.push(tokio::spawn(rotation_loop(
                Arc::downgrade(&self.inner),
                interval,
                shutdown_rx,
            )));
        }

        *self.inner.background.lock().await = Some(Background { shutdown, handles });
    }

    async fn signal_background(&self) {
        if let Some(bg) = self.inner.background.lock().await.as_ref() {
            let _ = bg.shutdown.send(true);
        }
    }

    async fn join_background(&self) {
        let background = self.inner.background.lock().await.take();
        let Some(Background { shutdown, handles }) = background else {
            return;
        };
        let _ = shutdown.send(true);
        for mut handle in handles {
            if timeout(self.inner.settings.shutdown_grace, &mut handle)
                .await
                .is_err()
            {
                warn!("Chain task ignored cancellation, aborting");
                handle.abort();
            }
        }
    }

    fn set_status(&self, status: ChainStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!("Chain status -> {}", status);
            self.inner.events.emit(VeilEvent::ChainStatus { status });
        }
    }

    fn fail(&self, error: &ChainError) {
        warn!("Chain failed: {}", error);
        self.set_status(ChainStatus::Error);
        self.inner.events.error(error.to_string());
    }

    fn announce(&self, chain: &Chain) {
        info!("Chain {} active: {}", chain.id(), chain.describe());
        self.inner.events.emit(VeilEvent::ChainConnected {
            chain_id: chain.id(),
            mode: chain.mode(),
            hops: chain.len(),
            route: chain.describe(),
        });
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        let supervisor = ChainSupervisor { inner };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = supervisor.heartbeat() => {}
        }
    }
    debug!("Heartbeat task finished");
}

async fn rotation_loop(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        let supervisor = ChainSupervisor { inner };
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = supervisor.rotate(true) => result,
        };
        if let Err(e) = result {
            warn!("Scheduled rotation failed: {}", e);
            break;
        }
    }
    debug!("Rotation task finished");
}
