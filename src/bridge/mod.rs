//! TUN-to-SOCKS bridge subprocess.
//!
//! The bridge executable owns the tunnel interface descriptor (inherited, not
//! copied) and forwards everything on it to a local SOCKS5 endpoint. This
//! module only supervises the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::process::{ExecutableLocator, ExitCode, LaunchSpec, ProcessLauncher, SupervisedProcess};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge executable '{0}' not found")]
    ExecutableNotFound(String),
    #[error("bridge is already running")]
    AlreadyRunning,
    #[error("permission denied starting bridge: {0}")]
    PermissionDenied(String),
    #[error("bridge exited right after start ({code})")]
    ProcessDiedImmediately { code: ExitCode },
    #[error("failed to launch bridge: {0}")]
    Launch(#[source] std::io::Error),
    #[error("bridge was never started")]
    NeverStarted,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub binary_name: String,
    pub binary_override: Option<PathBuf>,
    /// Wait before checking the process survived startup.
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    /// How long `stop` waits for the output drain to finish.
    pub drain_wait: Duration,
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            binary_name: "libtun2socks.so".to_string(),
            binary_override: None,
            startup_grace: Duration::from_millis(500),
            stop_grace: Duration::from_secs(3),
            drain_wait: Duration::from_secs(1),
            log_level: "warn".to_string(),
        }
    }
}

/// Parameters of the last successful start, kept for `restart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Attachment {
    tun_fd: i32,
    socks_addr: SocketAddr,
    mtu: u32,
}

pub struct TunnelBridge {
    launcher: Arc<dyn ProcessLauncher>,
    locator: ExecutableLocator,
    settings: BridgeSettings,
    child: Option<Box<dyn SupervisedProcess>>,
    drain: Option<JoinHandle<()>>,
    attachment: Option<Attachment>,
}

impl TunnelBridge {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        locator: ExecutableLocator,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            launcher,
            locator,
            settings,
            child: None,
            drain: None,
            attachment: None,
        }
    }

    /// Whether the bridge executable exists. Starts nothing.
    pub fn is_available(&self) -> bool {
        self.locator.is_available(
            &self.settings.binary_name,
            self.settings.binary_override.as_deref(),
        )
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// SOCKS endpoint the running bridge forwards to.
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.child.as_ref().and(self.attachment.map(|a| a.socks_addr))
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.try_exit().is_none(),
            None => false,
        }
    }

    /// Launch the bridge on `tun_fd`, forwarding to `socks_addr`.
    ///
    /// Succeeds only if the process is still alive after the startup grace.
    pub async fn start(
        &mut self,
        tun_fd: i32,
        socks_addr: SocketAddr,
        mtu: u32,
    ) -> Result<(), BridgeError> {
        if self.is_running() {
            return Err(BridgeError::AlreadyRunning);
        }
        // Reap a previous instance that exited on its own.
        self.stop().await;

        let binary = self
            .locator
            .locate(
                &self.settings.binary_name,
                self.settings.binary_override.as_deref(),
                false,
            )
            .ok_or_else(|| BridgeError::ExecutableNotFound(self.settings.binary_name.clone()))?;

        let spec = LaunchSpec::new(&binary)
            .arg("-device")
            .arg(format!("fd://{}", tun_fd))
            .arg("-proxy")
            .arg(format!("socks5://{}", socks_addr))
            .arg("-mtu")
            .arg(mtu.to_string())
            .arg("-loglevel")
            .arg(self.settings.log_level.clone())
            .inherit_fd(tun_fd);

        info!(
            "Starting bridge on fd {} -> socks5://{} (mtu {})",
            tun_fd, socks_addr, mtu
        );
        let mut child = self.launcher.launch(spec).await.map_err(|e| {
            error!("Bridge launch failed: {}", e);
            match e.kind() {
                std::io::ErrorKind::PermissionDenied => BridgeError::PermissionDenied(e.to_string()),
                _ => BridgeError::Launch(e),
            }
        })?;

        if let Some(output) = child.take_output() {
            self.drain = Some(tokio::spawn(drain(output)));
        }

        tokio::time::sleep(self.settings.startup_grace).await;
        if let Some(code) = child.try_exit() {
            error!("Bridge died during startup: {}", code);
            self.finish_drain().await;
            return Err(BridgeError::ProcessDiedImmediately { code });
        }

        info!("Bridge running (pid {:?})", child.id());
        self.child = Some(child);
        self.attachment = Some(Attachment {
            tun_fd,
            socks_addr,
            mtu,
        });
        Ok(())
    }

    /// Stop and start again with the last parameters.
    pub async fn restart(&mut self) -> Result<(), BridgeError> {
        let attachment = self.attachment.ok_or(BridgeError::NeverStarted)?;
        self.stop().await;
        self.start(attachment.tun_fd, attachment.socks_addr, attachment.mtu)
            .await
    }

    /// Terminate the bridge. Safe to call when nothing is running.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping bridge");
            child.terminate(self.settings.stop_grace).await;
        }
        self.finish_drain().await;
    }

    async fn finish_drain(&mut self) {
        if let Some(mut task) = self.drain.take() {
            if tokio::time::timeout(self.settings.drain_wait, &mut task)
                .await
                .is_err()
            {
                warn!("Bridge output drain did not finish, aborting");
                task.abort();
            }
        }
    }
}

/// Diagnostics only.
async fn drain(mut output: mpsc::Receiver<String>) {
    while let Some(line) = output.recv().await {
        debug!("bridge: {}", line);
    }
    debug!("Bridge output closed");
}
