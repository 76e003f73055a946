//! Local SOCKS5 endpoint backed by the supervised chain.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::socks5::{self, reply};
use super::{ChainConnector, ChainSupervisor, HopDelay};

/// Loopback SOCKS5 listener. Each client CONNECT gets its own path through
/// the supervisor's current chain.
pub struct ChainRelay {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ChainRelay {
    /// Bind on `addr` (port 0 picks a free port) and start accepting.
    pub async fn bind(addr: SocketAddr, supervisor: ChainSupervisor) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        // Per-connection paths skip the inter-hop pause.
        let connector = supervisor.connector().clone().with_delay(HopDelay::Disabled);
        let task = tokio::spawn(accept_loop(listener, supervisor, connector, shutdown_rx));
        info!("Chain relay listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every open client connection.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.shutdown.send(true);
        if let Err(e) = task.await {
            if !e.is_cancelled() {
                warn!("Chain relay task ended abnormally: {}", e);
            }
        }
        info!("Chain relay on {} stopped", self.local_addr);
    }
}

impl Drop for ChainRelay {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    supervisor: ChainSupervisor,
    connector: ChainConnector,
    mut shutdown: watch::Receiver<bool>,
) {
    // Dropping the set aborts in-flight client sessions.
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Relay client {}", peer);
                    let supervisor = supervisor.clone();
                    let connector = connector.clone();
                    sessions.spawn(async move {
                        if let Err(e) = handle_client(stream, &supervisor, &connector).await {
                            debug!("Relay session {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("Relay accept error: {}", e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
}

async fn handle_client(
    mut client: TcpStream,
    supervisor: &ChainSupervisor,
    connector: &ChainConnector,
) -> Result<(), socks5::Socks5Error> {
    socks5::accept_greeting(&mut client).await?;
    let (host, port) = socks5::read_connect_request(&mut client).await?;

    let Some(chain) = supervisor.active_chain().await else {
        warn!("Relay request for {}:{} with no active chain", host, port);
        return socks5::write_reply(&mut client, reply::GENERAL_FAILURE).await;
    };

    let mut upstream = match connector.open_stream(&chain, &host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Relay could not reach {}:{}: {}", host, port, e);
            let code = if e.hop_index().is_some_and(|i| i + 1 == chain.len()) {
                reply::HOST_UNREACHABLE
            } else {
                reply::GENERAL_FAILURE
            };
            return socks5::write_reply(&mut client, code).await;
        }
    };

    socks5::write_reply(&mut client, reply::SUCCESS).await?;
    let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!("Relay {}:{} closed ({} up, {} down)", host, port, up, down);
    Ok(())
}
