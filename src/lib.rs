//! veilnet - identity-hiding network egress.
//!
//! Routes traffic either through a supervised anonymity daemon or through a
//! multi-hop proxy chain, and bridges a TUN interface into whichever route is
//! active. [`orchestrator::Orchestrator`] is the entry point for embedders.

pub mod bridge;
pub mod chain;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod events;
pub mod orchestrator;
pub mod process;

pub use config::Config;
pub use events::{EventSink, VeilEvent};
pub use orchestrator::{Orchestrator, OrchestratorError, StartParams, TunnelInterface};
