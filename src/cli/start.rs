//! Foreground routing session.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use tokio::sync::mpsc;

use super::icons::{dim_arrow, error, info, success, warn};
use crate::chain::{Mode, TcpDialer};
use crate::config::Config;
use crate::events::VeilEvent;
use crate::orchestrator::{Orchestrator, StartParams, TunnelInterface};
use crate::process::TokioLauncher;

pub struct StartOptions {
    pub mode: Mode,
    pub bridges: bool,
    pub tun_fd: Option<i32>,
    pub mtu: Option<u32>,
    pub rotate_every: u64,
}

pub async fn cmd_start(config: &Config, options: StartOptions) -> anyhow::Result<()> {
    let (orchestrator, events) =
        Orchestrator::from_config(config, Arc::new(TokioLauncher), Arc::new(TcpDialer))?;
    let printer = tokio::spawn(print_events(events));

    let params = StartParams {
        mode: options.mode,
        use_bridges: options.bridges || config.daemon.use_bridges,
        tunnel: options.tun_fd.map(|fd| TunnelInterface {
            fd,
            mtu: options.mtu.unwrap_or(config.bridge.mtu),
        }),
        standard_tunnel_config: None,
    };

    eprintln!("{} Starting {} routing", info(), style(options.mode).bold());
    if let Err(e) = orchestrator.start(params).await {
        drop(orchestrator);
        flush(printer).await;
        anyhow::bail!("Start failed: {}", e);
    }

    let status = orchestrator.status().await;
    eprintln!("{} Routing active", success());
    if let Some(ref daemon) = status.daemon {
        eprintln!(
            "  {} SOCKS 127.0.0.1:{}  control 127.0.0.1:{}",
            dim_arrow(),
            daemon.socks_port,
            daemon.control_port
        );
    }
    if let Some(ref chain) = status.chain {
        eprintln!("  {} {} hops: {}", dim_arrow(), chain.hops, chain.route);
    }
    if let Some(addr) = status.relay_addr {
        eprintln!("  {} Relay on {}", dim_arrow(), addr);
    }
    eprintln!("  {} Press Ctrl-C to stop", dim_arrow());

    let mut rotation = (options.rotate_every > 0).then(|| {
        let period = Duration::from_secs(options.rotate_every);
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = async {
                match rotation.as_mut() {
                    Some(timer) => { timer.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                match orchestrator.rotate_chain().await {
                    Ok(()) => eprintln!("{} Rotated", success()),
                    Err(e) => eprintln!("{} Rotation failed: {}", warn(), e),
                }
            }
        }
    }

    eprintln!("{} Stopping", info());
    orchestrator.stop().await?;
    drop(orchestrator);
    flush(printer).await;
    eprintln!("{} Stopped", success());
    Ok(())
}

/// Let the printer show what is already queued once the senders are gone.
async fn flush(printer: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        tracing::debug!("Event printer still running at exit");
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<VeilEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = describe(&event) {
            eprintln!("{}", line);
        }
    }
}

/// One console line per event worth showing.
fn describe(event: &VeilEvent) -> Option<String> {
    let line = match event {
        VeilEvent::DaemonProgress { percent } => {
            format!("  {} Bootstrapped {}%", dim_arrow(), percent)
        }
        VeilEvent::DaemonState { state } => format!("  {} Daemon {}", dim_arrow(), state),
        VeilEvent::CircuitRenewed { exit_country } => format!(
            "  {} New circuit (exit {})",
            info(),
            exit_country.as_deref().unwrap_or("unknown")
        ),
        VeilEvent::ChainStatus { status } => format!("  {} Chain {}", dim_arrow(), status),
        VeilEvent::ChainConnected {
            mode, hops, route, ..
        } => format!("  {} {} chain up ({} hops): {}", success(), mode, hops, route),
        VeilEvent::HeartbeatFailed { hop_id, error: e } => {
            format!("  {} Heartbeat to {} failed: {}", warn(), hop_id, e)
        }
        VeilEvent::BridgeStarted { pid } => match pid {
            Some(pid) => format!("  {} Bridge running (pid {})", dim_arrow(), pid),
            None => format!("  {} Bridge running", dim_arrow()),
        },
        VeilEvent::BridgeStopped => return None,
        VeilEvent::Error { message } => format!("{} {}", error(), message),
    };
    Some(line)
}
