//! Multi-hop proxy chains.
//!
//! [`ChainBuilder`] turns a candidate pool into an ordered [`Chain`],
//! [`ChainConnector`] dials it hop by hop, and [`ChainSupervisor`] keeps the
//! live chain healthy and rotates it. [`ChainRelay`] exposes the active chain
//! as a local SOCKS5 endpoint for the TUN bridge.

mod builder;
mod connector;
mod hop;
mod mode;
mod relay;
mod shadowsocks;
pub(crate) mod socks5;
mod supervisor;
mod transport;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use builder::{ChainBuilder, SURVEILLANCE_ALLIANCE};
pub use connector::{ChainConnector, HopDelay};
pub use hop::{Credentials, HopRole, Protocol, ProxyHop, SecurityTier, ServerEntry};
pub use mode::Mode;
pub use relay::ChainRelay;
pub use supervisor::{ChainSupervisor, SupervisorSettings};
pub use transport::{BoxedStream, Dialer, ProxyConnection, ProxyStream, TcpDialer};

/// Chain failures.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no servers left after excluding surveillance-alliance countries")]
    NoSafeServers,
    #[error("chain build failed: {0}")]
    BuildFailed(String),
    #[error("hop {hop} ({hop_id}) unreachable: {source}")]
    HopUnreachable {
        hop: usize,
        hop_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake failed at hop {hop} ({hop_id}): {reason}")]
    HandshakeFailed {
        hop: usize,
        hop_id: String,
        reason: String,
    },
    #[error("invalid server entry: {0}")]
    InvalidServer(String),
    #[error("no active chain")]
    NotActive,
    #[error("a chain is already active")]
    AlreadyActive,
}

impl ChainError {
    /// Index of the hop that failed, for connect-phase errors.
    pub fn hop_index(&self) -> Option<usize> {
        match self {
            ChainError::HopUnreachable { hop, .. } | ChainError::HandshakeFailed { hop, .. } => {
                Some(*hop)
            }
            _ => None,
        }
    }
}

/// Lifecycle of the supervised chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    #[default]
    Inactive,
    Connecting,
    Connected,
    Rotating,
    Error,
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStatus::Inactive => write!(f, "inactive"),
            ChainStatus::Connecting => write!(f, "connecting"),
            ChainStatus::Connected => write!(f, "connected"),
            ChainStatus::Rotating => write!(f, "rotating"),
            ChainStatus::Error => write!(f, "error"),
        }
    }
}

/// Ordered hops with roles assigned by position: index 0 is the entry, the
/// last index the exit, everything between a middle hop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chain {
    id: Uuid,
    mode: Mode,
    hops: Vec<ProxyHop>,
    created_at: DateTime<Utc>,
}

impl Chain {
    /// Build a chain, assigning roles. Fails on an empty hop list.
    pub fn new(mode: Mode, hops: Vec<ProxyHop>) -> Result<Self, ChainError> {
        if hops.is_empty() {
            return Err(ChainError::BuildFailed("a chain needs at least one hop".into()));
        }
        let len = hops.len();
        let hops = hops
            .into_iter()
            .enumerate()
            .map(|(i, hop)| hop.with_role(HopRole::for_position(i, len)))
            .collect();
        Ok(Self {
            id: Uuid::new_v4(),
            mode,
            hops,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn hops(&self) -> &[ProxyHop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn entry(&self) -> &ProxyHop {
        &self.hops[0]
    }

    pub fn exit(&self) -> &ProxyHop {
        &self.hops[self.hops.len() - 1]
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// `name -> name -> name` for logs and status output.
    pub fn describe(&self) -> String {
        self.hops
            .iter()
            .map(|h| h.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hop(n: u16) -> ProxyHop {
        ProxyHop::new(Protocol::Socks5, format!("10.0.0.{n}"), 1080)
    }

    #[test]
    fn test_roles_assigned_by_position() {
        let chain = Chain::new(Mode::Custom, vec![hop(1), hop(2), hop(3), hop(4)]).unwrap();
        let roles: Vec<HopRole> = chain.hops().iter().map(|h| h.role).collect();
        assert_eq!(
            roles,
            vec![HopRole::Entry, HopRole::Middle, HopRole::Middle, HopRole::Exit]
        );
        assert_eq!(chain.entry().host, "10.0.0.1");
        assert_eq!(chain.exit().host, "10.0.0.4");
    }

    #[test]
    fn test_single_hop_is_entry_and_exit() {
        let chain = Chain::new(Mode::Custom, vec![hop(1)]).unwrap();
        assert!(chain.entry().role.is_entry());
        assert!(chain.exit().role.is_exit());
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(matches!(
            Chain::new(Mode::Turbo, vec![]),
            Err(ChainError::BuildFailed(_))
        ));
    }
}
