//! Status events published to the embedding application.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::chain::{ChainStatus, Mode};
use crate::daemon::DaemonState;

/// Progress, state and error notifications from background work.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VeilEvent {
    DaemonProgress {
        percent: u8,
    },
    DaemonState {
        state: DaemonState,
    },
    CircuitRenewed {
        exit_country: Option<String>,
    },
    ChainStatus {
        status: ChainStatus,
    },
    ChainConnected {
        chain_id: Uuid,
        mode: Mode,
        hops: usize,
        route: String,
    },
    HeartbeatFailed {
        hop_id: String,
        error: String,
    },
    BridgeStarted {
        pid: Option<u32>,
    },
    BridgeStopped,
    Error {
        message: String,
    },
}

/// Sending half of the event channel. Cheap to clone; emitting never blocks
/// and a dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<VeilEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<VeilEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: VeilEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Event receiver dropped");
            }
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(VeilEvent::Error {
            message: message.into(),
        });
    }
}
