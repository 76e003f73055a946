//! Anonymity daemon supervision.
//!
//! The daemon runs as a child process. [`DaemonProcess`] writes its runtime
//! configuration, launches it, follows bootstrap progress on its output and
//! drives it over the authenticated control port once it is ready.

mod bootstrap;
mod control;
mod process;
mod torrc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use bootstrap::{classify, wait_for_bootstrap, BootstrapOutcome, LineKind};
pub use control::{ControlChannel, ControlError, ControlReply, ReplyLine, STATUS_OK};
pub use process::DaemonProcess;
pub use torrc::{usable_bridges, RuntimeConfig, TransportPlugin, COOKIE_FILE};

/// Daemon supervision failures.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon executable '{0}' not found")]
    ExecutableNotFound(String),
    #[error("daemon is already running")]
    AlreadyRunning,
    #[error("daemon did not finish bootstrapping within {secs}s (reached {last_percent}%)", secs = .timeout.as_secs())]
    BootstrapTimeout { timeout: Duration, last_percent: u8 },
    #[error("daemon reported a fatal error: {0}")]
    BootstrapFailed(String),
    #[error("daemon exited during bootstrap ({last_percent}%)")]
    ExitedDuringBootstrap { last_percent: u8 },
    #[error("failed to launch daemon: {0}")]
    Launch(#[source] std::io::Error),
    #[error("daemon control port is not available")]
    ControlUnavailable,
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supervisor state.
///
/// `Idle -> Starting -> Bootstrapping -> Ready -> Stopping -> Idle`, with
/// `Errored` reachable from `Starting` and `Bootstrapping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DaemonState {
    Idle,
    Starting,
    Bootstrapping { percent: u8 },
    Ready,
    Stopping,
    Errored,
}

impl DaemonState {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            DaemonState::Starting | DaemonState::Bootstrapping { .. } | DaemonState::Ready
        )
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonState::Idle => write!(f, "idle"),
            DaemonState::Starting => write!(f, "starting"),
            DaemonState::Bootstrapping { percent } => write!(f, "bootstrapping ({}%)", percent),
            DaemonState::Ready => write!(f, "ready"),
            DaemonState::Stopping => write!(f, "stopping"),
            DaemonState::Errored => write!(f, "errored"),
        }
    }
}

/// A pluggable-transport helper the daemon may use when bridges are on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportBinary {
    /// Transport name used in bridge lines.
    pub name: String,
    /// Executable file name, resolved through the executable locator.
    pub binary: String,
}

impl TransportBinary {
    pub fn new(name: &str, binary: &str) -> Self {
        Self {
            name: name.to_string(),
            binary: binary.to_string(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("obfs4", "libobfs4proxy.so"),
            Self::new("meek_lite", "libobfs4proxy.so"),
            Self::new("snowflake", "libsnowflake.so"),
        ]
    }
}

/// Everything [`DaemonProcess`] needs to know about ports, paths and timing.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub binary_name: String,
    pub binary_override: Option<PathBuf>,
    /// Runtime directory; the configuration and cookie files live here.
    pub data_dir: PathBuf,
    pub socks_port: u16,
    pub dns_port: u16,
    pub control_port: u16,
    pub bootstrap_timeout: Duration,
    pub stop_grace: Duration,
    /// Pause after a circuit rotation before re-querying the exit.
    pub settle_delay: Duration,
    pub control_timeout: Duration,
    pub transports: Vec<TransportBinary>,
    pub bridge_lines: Vec<String>,
}

impl DaemonSettings {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_name: "libtor.so".to_string(),
            binary_override: None,
            data_dir: data_dir.into(),
            socks_port: 9050,
            dns_port: 5400,
            control_port: 9051,
            bootstrap_timeout: Duration::from_secs(60),
            stop_grace: Duration::from_secs(3),
            settle_delay: Duration::from_secs(2),
            control_timeout: Duration::from_secs(5),
            transports: TransportBinary::defaults(),
            bridge_lines: Vec::new(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("torrc")
    }

    pub fn socks_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.socks_port))
    }
}

/// Point-in-time view of the supervised daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonHandle {
    pub pid: Option<u32>,
    pub binary: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub socks_port: u16,
    pub control_port: u16,
    pub dns_port: u16,
    pub bootstrap_percent: u8,
    pub running: bool,
    pub exit_country: Option<String>,
    pub state: DaemonState,
}

/// Best-effort answers to the read-only circuit queries. A failed query
/// leaves its field empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitInfo {
    pub circuit_status: Option<String>,
    pub socks_listeners: Option<String>,
    pub exit_country: Option<String>,
}
