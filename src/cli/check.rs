//! Pre-flight capability check.

use std::sync::Arc;

use console::style;

use super::icons::{error, success, warn};
use crate::bridge::TunnelBridge;
use crate::chain::{ChainConnector, TcpDialer};
use crate::config::Config;
use crate::daemon::DaemonProcess;
use crate::process::{ExecutableLocator, TokioLauncher};

/// Report which executables, transport helpers and servers are usable.
/// With `servers` set, each configured server is dialed once.
pub async fn cmd_check(config: &Config, servers: bool) -> anyhow::Result<()> {
    let locator = ExecutableLocator::new(config.install_layout());
    let launcher = Arc::new(TokioLauncher);
    let daemon = DaemonProcess::new(launcher.clone(), locator.clone(), config.daemon_settings());
    let bridge = TunnelBridge::new(launcher, locator.clone(), config.bridge_settings());

    println!("{}", style("Executables").bold());
    let daemon_ok = daemon.is_available();
    report(&config.install.daemon_binary, daemon_ok, true);
    let bridge_ok = bridge.is_available();
    report(&config.install.bridge_binary, bridge_ok, true);

    println!("{}", style("Transport helpers").bold());
    let found = daemon.available_transports();
    for transport in &config.install.transports {
        let present = found.iter().any(|t| t.name == transport.name);
        report(
            &format!("{} ({})", transport.name, transport.binary),
            present,
            false,
        );
    }

    println!("{}", style("Servers").bold());
    match config.server_pool() {
        Ok(pool) => {
            println!("  {} {} configured", success(), pool.len());
            if servers {
                let connector = ChainConnector::new(Arc::new(TcpDialer))
                    .with_connect_timeout(config.connect_timeout());
                for hop in &pool {
                    let reachable = connector.check_reachable(hop).await;
                    if let Err(ref e) = reachable {
                        tracing::debug!("{} unreachable: {}", hop.address(), e);
                    }
                    report(
                        &format!("{} {}", hop.protocol, hop.address()),
                        reachable.is_ok(),
                        false,
                    );
                }
            }
        }
        Err(e) => println!("  {} {}", error(), e),
    }

    if !daemon_ok && !bridge_ok {
        anyhow::bail!(
            "Neither the daemon nor the bridge executable was found under {}",
            locator.layout().data_dir.display()
        );
    }
    Ok(())
}

fn report(name: &str, present: bool, required: bool) {
    let icon = match (present, required) {
        (true, _) => success(),
        (false, true) => error(),
        (false, false) => warn(),
    };
    let state = if present { "found" } else { "missing" };
    println!("  {} {:<36} {}", icon, name, style(state).dim());
}
