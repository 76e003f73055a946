//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod check;
mod config_cmd;
mod icons;
mod plan;
mod start;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::chain::Mode;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "veilnet")]
#[command(about = "Identity-hiding egress through an anonymity daemon or a multi-hop proxy chain")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Start routing and keep it up until Ctrl-C
    Start {
        /// Routing mode: turbo, custom, ghost, stealth, paranoid or daemon
        #[arg(short, long, default_value = "daemon")]
        mode: Mode,
        /// Start the daemon with bridges enabled
        #[arg(long)]
        bridges: bool,
        /// Tunnel interface descriptor to bridge into the route
        #[arg(long)]
        tun_fd: Option<i32>,
        /// Tunnel MTU (defaults to the configured value)
        #[arg(long, requires = "tun_fd")]
        mtu: Option<u32>,
        /// Rotate the chain or circuit every N seconds (0 = never)
        #[arg(long, default_value = "0")]
        rotate_every: u64,
    },

    /// Build a chain from the configured servers and print it (no network I/O)
    Plan {
        /// Routing mode to plan for
        #[arg(short, long, default_value = "turbo")]
        mode: Mode,
        /// Seed for reproducible hop selection
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Pre-flight: report which executables are installed
    Check {
        /// Also try connecting to every configured server
        #[arg(long)]
        servers: bool,
    },

    /// Print the effective configuration
    Config {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

async fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Config::load_from_path(&path)
                .await
                .map_err(|e| anyhow::anyhow!(e))
        }
        None => Ok(Config::load().await),
    }
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config).await?;

    match cli.command {
        Commands::Start {
            mode,
            bridges,
            tun_fd,
            mtu,
            rotate_every,
        } => {
            let options = start::StartOptions {
                mode,
                bridges,
                tun_fd,
                mtu,
                rotate_every,
            };
            start::cmd_start(&config, options).await
        }
        Commands::Plan { mode, seed } => plan::cmd_plan(&config, mode, seed),
        Commands::Check { servers } => check::cmd_check(&config, servers).await,
        Commands::Config { json } => config_cmd::cmd_config_show(&config, json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from([
            "veilnet", "start", "--mode", "ghost", "--tun-fd", "7", "--mtu", "1400",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                mode, tun_fd, mtu, ..
            } => {
                assert_eq!(mode, Mode::Ghost);
                assert_eq!(tun_fd, Some(7));
                assert_eq!(mtu, Some(1400));
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_mtu_requires_descriptor() {
        assert!(Cli::try_parse_from(["veilnet", "start", "--mtu", "1400"]).is_err());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["veilnet", "plan", "--mode", "warp"]).is_err());
    }

    #[test]
    fn test_parse_check() {
        let cli = Cli::try_parse_from(["veilnet", "check"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { servers: false }));
        let cli = Cli::try_parse_from(["veilnet", "check", "--servers"]).unwrap();
        assert!(matches!(cli.command, Commands::Check { servers: true }));
    }
}
