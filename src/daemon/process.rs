//! Daemon process lifecycle.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bootstrap::{drain_output, wait_for_bootstrap, BootstrapOutcome};
use super::control::ControlChannel;
use super::torrc::{usable_bridges, RuntimeConfig, TransportPlugin};
use super::{CircuitInfo, DaemonError, DaemonHandle, DaemonSettings, DaemonState};
use crate::process::{ExecutableLocator, LaunchSpec, ProcessLauncher, SupervisedProcess};

/// Supervises one daemon child at a time.
///
/// Not internally synchronised: the owner serialises `start`, `stop` and the
/// circuit commands. Progress is published through [`bootstrap_watch`]
/// (written only while bootstrapping).
///
/// [`bootstrap_watch`]: DaemonProcess::bootstrap_watch
pub struct DaemonProcess {
    launcher: Arc<dyn ProcessLauncher>,
    locator: ExecutableLocator,
    settings: DaemonSettings,
    state: DaemonState,
    binary: Option<PathBuf>,
    child: Option<Box<dyn SupervisedProcess>>,
    control: Option<ControlChannel>,
    drain: Option<JoinHandle<()>>,
    percent: watch::Sender<u8>,
    exit_country: Option<String>,
}

impl DaemonProcess {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        locator: ExecutableLocator,
        settings: DaemonSettings,
    ) -> Self {
        let (percent, _) = watch::channel(0);
        Self {
            launcher,
            locator,
            settings,
            state: DaemonState::Idle,
            binary: None,
            child: None,
            control: None,
            drain: None,
            percent,
            exit_country: None,
        }
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn state(&self) -> DaemonState {
        match self.state {
            DaemonState::Bootstrapping { .. } => DaemonState::Bootstrapping {
                percent: *self.percent.borrow(),
            },
            other => other,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == DaemonState::Ready
    }

    /// Bootstrap percentage, readable from any task.
    pub fn bootstrap_watch(&self) -> watch::Receiver<u8> {
        self.percent.subscribe()
    }

    pub fn socks_addr(&self) -> SocketAddr {
        self.settings.socks_addr()
    }

    /// Snapshot of the supervised process.
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            pid: self.child.as_ref().and_then(|c| c.id()),
            binary: self.binary.clone(),
            data_dir: self.settings.data_dir.clone(),
            config_path: self.settings.config_path(),
            socks_port: self.settings.socks_port,
            control_port: self.settings.control_port,
            dns_port: self.settings.dns_port,
            bootstrap_percent: *self.percent.borrow(),
            running: self.state().is_running(),
            exit_country: self.exit_country.clone(),
            state: self.state(),
        }
    }

    /// Whether the daemon executable can be found (no extraction).
    pub fn is_available(&self) -> bool {
        self.locator.is_available(
            &self.settings.binary_name,
            self.settings.binary_override.as_deref(),
        )
    }

    /// Pluggable-transport helpers present on disk. Missing helpers are
    /// skipped.
    pub fn available_transports(&self) -> Vec<TransportPlugin> {
        self.settings
            .transports
            .iter()
            .filter_map(|t| match self.locator.locate(&t.binary, None, false) {
                Some(path) => Some(TransportPlugin {
                    name: t.name.clone(),
                    path,
                }),
                None => {
                    debug!("Transport {} not installed ({})", t.name, t.binary);
                    None
                }
            })
            .collect()
    }

    /// Whether a bridged start would have at least one bridge to use.
    pub fn has_usable_bridges(&self) -> bool {
        !usable_bridges(&self.settings.bridge_lines, &self.available_transports()).is_empty()
    }

    /// Launch the daemon and wait until it reports 100% bootstrap.
    ///
    /// `on_progress` is called once per percentage increase. On timeout or a
    /// fatal log line the process is killed and the state is left `Errored`.
    pub async fn start<F>(&mut self, use_bridges: bool, on_progress: F) -> Result<(), DaemonError>
    where
        F: FnMut(u8) + Send,
    {
        match self.state {
            DaemonState::Idle => {}
            DaemonState::Errored => self.reset().await,
            _ => return Err(DaemonError::AlreadyRunning),
        }

        self.state = DaemonState::Starting;
        self.percent.send_replace(0);

        match self.launch(use_bridges).await {
            Ok(child) => self.child = Some(child),
            Err(e) => {
                error!("Daemon launch failed: {}", e);
                self.state = DaemonState::Errored;
                return Err(e);
            }
        }

        let output = self.child.as_mut().and_then(|c| c.take_output());
        let Some(mut output) = output else {
            self.abort_start().await;
            return Err(DaemonError::ExitedDuringBootstrap { last_percent: 0 });
        };

        self.state = DaemonState::Bootstrapping { percent: 0 };
        let timeout = self.settings.bootstrap_timeout;
        let outcome = wait_for_bootstrap(&mut output, timeout, &self.percent, on_progress).await;

        match outcome {
            BootstrapOutcome::Ready => {
                info!("Daemon bootstrapped");
                self.drain = Some(tokio::spawn(drain_output(output)));
                self.state = DaemonState::Ready;
                self.open_control().await;
                if self.control.is_some() {
                    self.exit_country = self.query_exit_country().await;
                }
                Ok(())
            }
            BootstrapOutcome::TimedOut { last_percent } => {
                error!(
                    "Daemon bootstrap timed out after {}s at {}%",
                    timeout.as_secs(),
                    last_percent
                );
                self.abort_start().await;
                Err(DaemonError::BootstrapTimeout {
                    timeout,
                    last_percent,
                })
            }
            BootstrapOutcome::Fatal(line) => {
                self.abort_start().await;
                Err(DaemonError::BootstrapFailed(line))
            }
            BootstrapOutcome::OutputClosed { last_percent } => {
                if let Some(code) = self.child.as_mut().and_then(|c| c.try_exit()) {
                    error!("Daemon exited during bootstrap: {}", code);
                }
                self.abort_start().await;
                Err(DaemonError::ExitedDuringBootstrap { last_percent })
            }
        }
    }

    /// Rotate identity. The daemon rate-limits this itself: a request during
    /// its cool-down succeeds without changing the exit.
    pub async fn request_new_circuit(&mut self) -> Result<Option<String>, DaemonError> {
        let control = self.control.as_mut().ok_or(DaemonError::ControlUnavailable)?;
        control.send("SIGNAL NEWNYM").await?;
        info!("Requested new circuit");

        tokio::time::sleep(self.settings.settle_delay).await;
        self.exit_country = self.query_exit_country().await;
        Ok(self.exit_country.clone())
    }

    /// Read-only circuit queries. Each failed query leaves its field empty.
    pub async fn circuit_info(&mut self) -> CircuitInfo {
        let mut info = CircuitInfo {
            circuit_status: self.getinfo("circuit-status").await,
            socks_listeners: self.getinfo("net/listeners/socks").await,
            exit_country: self.query_exit_country().await,
        };
        if info.exit_country.is_some() {
            self.exit_country = info.exit_country.clone();
        } else {
            info.exit_country = self.exit_country.clone();
        }
        info
    }

    /// Shut the daemon down and return to `Idle`. A no-op when idle.
    pub async fn stop(&mut self) {
        if self.state == DaemonState::Idle && self.child.is_none() {
            return;
        }
        self.state = DaemonState::Stopping;
        info!("Stopping daemon");

        if let Some(mut control) = self.control.take() {
            if let Err(e) = control.send("SIGNAL SHUTDOWN").await {
                debug!("SIGNAL SHUTDOWN failed: {}", e);
            }
        }
        self.reset().await;
    }

    async fn launch(&mut self, use_bridges: bool) -> Result<Box<dyn SupervisedProcess>, DaemonError> {
        let binary = self
            .locator
            .locate(
                &self.settings.binary_name,
                self.settings.binary_override.as_deref(),
                true,
            )
            .ok_or_else(|| DaemonError::ExecutableNotFound(self.settings.binary_name.clone()))?;
        self.binary = Some(binary.clone());

        let data_dir = &self.settings.data_dir;
        fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(data_dir, fs::Permissions::from_mode(0o700))?;
        }

        let transports = if use_bridges {
            let found = self.available_transports();
            if found.is_empty() {
                warn!("Bridges requested but no transport helpers are installed");
            }
            if usable_bridges(&self.settings.bridge_lines, &found).is_empty() {
                warn!("Bridges requested but no usable bridge line is configured, starting without bridges");
            }
            Some(found)
        } else {
            None
        };

        let runtime = RuntimeConfig {
            data_dir,
            socks_port: self.settings.socks_port,
            dns_port: self.settings.dns_port,
            control_port: self.settings.control_port,
            transports: transports.as_deref(),
            bridge_lines: &self.settings.bridge_lines,
        };
        let config_path = self.settings.config_path();
        fs::write(&config_path, runtime.render())?;

        let cookie = runtime.cookie_path();
        if cookie.exists() {
            fs::remove_file(&cookie)?;
        }

        let mut spec = LaunchSpec::new(&binary)
            .arg("-f")
            .arg(config_path.to_string_lossy());
        if let Some(dir) = binary.parent() {
            spec = spec
                .current_dir(dir)
                .env("LD_LIBRARY_PATH", dir.to_string_lossy());
        }

        info!(
            "Starting daemon {} (bridges: {})",
            binary.display(),
            use_bridges
        );
        debug!("Daemon config: {}", config_path.display());

        self.launcher
            .launch(spec)
            .await
            .map_err(DaemonError::Launch)
    }

    async fn open_control(&mut self) {
        let cookie_path = RuntimeConfig {
            data_dir: &self.settings.data_dir,
            socks_port: self.settings.socks_port,
            dns_port: self.settings.dns_port,
            control_port: self.settings.control_port,
            transports: None,
            bridge_lines: &[],
        }
        .cookie_path();

        let cookie = match tokio::fs::read(&cookie_path).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("No control cookie at {}: {}", cookie_path.display(), e);
                None
            }
        };

        let result = async {
            let mut channel =
                ControlChannel::connect(self.settings.control_port, self.settings.control_timeout)
                    .await?;
            channel.authenticate(cookie.as_deref()).await?;
            Ok::<_, super::ControlError>(channel)
        }
        .await;

        match result {
            Ok(channel) => {
                debug!("Control session authenticated");
                self.control = Some(channel);
            }
            Err(e) => warn!("Control session unavailable: {}", e),
        }
    }

    async fn getinfo(&mut self, key: &str) -> Option<String> {
        let control = self.control.as_mut()?;
        match control.send(&format!("GETINFO {}", key)).await {
            Ok(reply) => reply.value(key),
            Err(e) => {
                debug!("GETINFO {} failed: {}", key, e);
                None
            }
        }
    }

    async fn query_exit_country(&mut self) -> Option<String> {
        self.getinfo("ip-to-country/me")
            .await
            .filter(|c| !c.is_empty() && c != "??")
            .map(|c| c.to_uppercase())
    }

    /// Kill whatever a failed start left running.
    async fn abort_start(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.terminate(self.settings.stop_grace).await;
        }
        self.state = DaemonState::Errored;
    }

    async fn reset(&mut self) {
        self.control = None;
        if let Some(mut child) = self.child.take() {
            child.terminate(self.settings.stop_grace).await;
        }
        if let Some(mut drain) = self.drain.take() {
            if tokio::time::timeout(Duration::from_millis(500), &mut drain)
                .await
                .is_err()
            {
                drain.abort();
            }
        }
        self.exit_country = None;
        self.binary = None;
        self.percent.send_replace(0);
        self.state = DaemonState::Idle;
    }
}
