//! Hop-by-hop chain connection.

use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::transport::{BoxedStream, Dialer, ProxyConnection};
use super::{shadowsocks, socks5, Chain, ChainError, Mode, Protocol, ProxyHop};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Pause inserted between hop connections so the chain does not open with a
/// recognisable timing pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HopDelay {
    /// Random delay from the chain mode's range.
    #[default]
    ByMode,
    Disabled,
}

impl HopDelay {
    pub fn range_for(self, mode: Mode) -> Option<RangeInclusive<u64>> {
        match self {
            HopDelay::Disabled => None,
            HopDelay::ByMode => {
                let range = mode.inter_hop_delay_ms();
                (*range.end() > 0).then_some(range)
            }
        }
    }

    fn sample(self, mode: Mode) -> Duration {
        match self.range_for(mode) {
            Some(range) => Duration::from_millis(rand::thread_rng().gen_range(range)),
            None => Duration::ZERO,
        }
    }
}

/// Walks a chain's hops, tunnelling through earlier hops where the protocol
/// allows it and performing each hop's handshake.
#[derive(Clone)]
pub struct ChainConnector {
    dialer: Arc<dyn Dialer>,
    connect_timeout: Duration,
    delay: HopDelay,
}

impl ChainConnector {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            delay: HopDelay::default(),
        }
    }

    /// Bound on each hop's transport plus handshake.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_delay(mut self, delay: HopDelay) -> Self {
        self.delay = delay;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connect every hop in order.
    ///
    /// On failure every connection opened for this attempt is closed before
    /// the error (which names the failing hop) is returned.
    pub async fn connect(&self, chain: &Chain) -> Result<Vec<ProxyConnection>, ChainError> {
        info!(
            "Connecting {}-hop {} chain: {}",
            chain.len(),
            chain.mode(),
            chain.describe()
        );

        let mut opened: Vec<ProxyConnection> = Vec::with_capacity(chain.len());
        for (index, hop) in chain.hops().iter().enumerate() {
            if index > 0 {
                let pause = self.delay.sample(chain.mode());
                if !pause.is_zero() {
                    debug!("Waiting {}ms before hop {}", pause.as_millis(), index);
                    tokio::time::sleep(pause).await;
                }
            }

            match self.connect_hop(index, hop, opened.last_mut()).await {
                Ok(conn) => {
                    debug!("Hop {} ({} {}) ready", index, hop.protocol, hop.address());
                    opened.push(conn);
                }
                Err(e) => {
                    warn!("Chain connect failed: {}", e);
                    close_connections(opened).await;
                    return Err(e);
                }
            }
        }

        info!("Chain {} connected", chain.id());
        Ok(opened)
    }

    /// Connect the chain and CONNECT through its exit to `host:port`,
    /// returning the end-to-end stream.
    pub async fn open_stream(
        &self,
        chain: &Chain,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, ChainError> {
        let exit_index = chain.len() - 1;
        let exit = chain.exit();
        if exit.protocol != Protocol::Socks5 {
            return Err(handshake_failed(
                exit_index,
                exit,
                format!("{} exit cannot open streams", exit.protocol),
            ));
        }

        let mut connections = self.connect(chain).await?;
        let exit_conn = match connections.pop() {
            Some(conn) => conn,
            None => return Err(ChainError::NotActive),
        };
        close_connections(connections).await;

        let hop = exit_conn.hop().clone();
        let mut stream = exit_conn
            .into_stream()
            .ok_or_else(|| handshake_failed(exit_index, &hop, "exit stream unavailable"))?;

        match timeout(self.connect_timeout, socks5::connect(&mut stream, host, port)).await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(handshake_failed(
                exit_index,
                &hop,
                format!("CONNECT {}:{} failed: {}", host, port, e),
            )),
            Err(_) => Err(handshake_failed(exit_index, &hop, "CONNECT timed out")),
        }
    }

    /// Whether `hop` accepts a transport connection. The connection is closed
    /// straight away; no handshake is attempted.
    pub async fn check_reachable(&self, hop: &ProxyHop) -> io::Result<()> {
        let mut stream = timeout(self.connect_timeout, self.dialer.dial(&hop.host, hop.port))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown after reachability check of {}: {}", hop.address(), e);
        }
        Ok(())
    }

    async fn connect_hop(
        &self,
        index: usize,
        hop: &ProxyHop,
        prev: Option<&mut ProxyConnection>,
    ) -> Result<ProxyConnection, ChainError> {
        let deadline = Instant::now() + self.connect_timeout;
        let mut stream = self.open_transport(index, hop, prev, deadline).await?;

        match timeout_at(deadline, handshake(index, hop, &mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(handshake_failed(index, hop, "handshake timed out")),
        }

        Ok(ProxyConnection::new(hop.clone(), index, stream))
    }

    /// Tunnel through the previous hop where possible, otherwise dial.
    async fn open_transport(
        &self,
        index: usize,
        hop: &ProxyHop,
        prev: Option<&mut ProxyConnection>,
        deadline: Instant,
    ) -> Result<BoxedStream, ChainError> {
        let tunnel = match (hop.protocol, prev) {
            (Protocol::Socks5 | Protocol::Shadowsocks, Some(prev))
                if prev.hop().protocol == Protocol::Socks5 =>
            {
                prev.forward_stream().map(|s| (s, true))
            }
            (Protocol::Shadowsocks, Some(prev)) => prev.forward_stream().map(|s| (s, false)),
            _ => None,
        };

        match tunnel {
            Some((mut stream, true)) => {
                debug!("Tunnelling hop {} through hop {}", index, index - 1);
                match timeout_at(deadline, socks5::connect(&mut stream, &hop.host, hop.port)).await
                {
                    Ok(Ok(())) => Ok(stream),
                    Ok(Err(e)) => Err(handshake_failed(
                        index,
                        hop,
                        format!("CONNECT through hop {} failed: {}", index - 1, e),
                    )),
                    Err(_) => Err(unreachable(
                        index,
                        hop,
                        io::Error::new(io::ErrorKind::TimedOut, "tunnelled connect timed out"),
                    )),
                }
            }
            Some((stream, false)) => {
                debug!("Hop {} reuses hop {} transport", index, index - 1);
                Ok(stream)
            }
            None => match timeout_at(deadline, self.dialer.dial(&hop.host, hop.port)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(unreachable(index, hop, e)),
                Err(_) => Err(unreachable(
                    index,
                    hop,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                )),
            },
        }
    }
}

async fn handshake(index: usize, hop: &ProxyHop, stream: &mut BoxedStream) -> Result<(), ChainError> {
    match hop.protocol {
        Protocol::Socks5 => socks5::negotiate(stream, hop.credentials.as_ref())
            .await
            .map_err(|e| handshake_failed(index, hop, e.to_string())),
        Protocol::Shadowsocks => {
            let mut rng = StdRng::from_entropy();
            shadowsocks::init_session(stream, hop, &mut rng)
                .await
                .map_err(|reason| handshake_failed(index, hop, reason))
        }
        Protocol::V2ray | Protocol::Trojan => Err(handshake_failed(
            index,
            hop,
            format!("{} handshake is not implemented", hop.protocol),
        )),
    }
}

/// Close connections exit-first. Each is consumed, so none can close twice.
pub async fn close_connections(connections: Vec<ProxyConnection>) {
    for conn in connections.into_iter().rev() {
        conn.close().await;
    }
}

fn handshake_failed(index: usize, hop: &ProxyHop, reason: impl Into<String>) -> ChainError {
    ChainError::HandshakeFailed {
        hop: index,
        hop_id: hop.id.clone(),
        reason: reason.into(),
    }
}

fn unreachable(index: usize, hop: &ProxyHop, source: io::Error) -> ChainError {
    ChainError::HopUnreachable {
        hop: index,
        hop_id: hop.id.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TcpDialer;

    #[test]
    fn test_delay_ranges() {
        assert_eq!(HopDelay::ByMode.range_for(Mode::Turbo), Some(100..=300));
        assert_eq!(HopDelay::ByMode.range_for(Mode::DaemonBacked), None);
        assert_eq!(HopDelay::Disabled.range_for(Mode::Paranoid), None);

        for _ in 0..20 {
            let d = HopDelay::ByMode.sample(Mode::Paranoid);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(2000));
        }
    }

    #[tokio::test]
    async fn test_unimplemented_protocol_fails_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let hop = ProxyHop::new(Protocol::Trojan, "127.0.0.1", port);
        let chain = Chain::new(Mode::Custom, vec![hop]).unwrap();
        let connector = ChainConnector::new(Arc::new(TcpDialer)).with_delay(HopDelay::Disabled);

        let err = connector.connect(&chain).await.unwrap_err();
        assert!(matches!(err, ChainError::HandshakeFailed { hop: 0, .. }));
        assert!(err.to_string().contains("not implemented"));
    }

    #[tokio::test]
    async fn test_refused_entry_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let chain = Chain::new(
            Mode::Custom,
            vec![ProxyHop::new(Protocol::Socks5, "127.0.0.1", port)],
        )
        .unwrap();
        let connector = ChainConnector::new(Arc::new(TcpDialer))
            .with_delay(HopDelay::Disabled)
            .with_connect_timeout(Duration::from_secs(2));

        let err = connector.connect(&chain).await.unwrap_err();
        assert_eq!(err.hop_index(), Some(0));
        assert!(matches!(err, ChainError::HopUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_check_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = ProxyHop::new(Protocol::Socks5, "127.0.0.1", listener.local_addr().unwrap().port());
        let closed = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ProxyHop::new(Protocol::Socks5, "127.0.0.1", l.local_addr().unwrap().port())
        };
        let connector = ChainConnector::new(Arc::new(TcpDialer))
            .with_connect_timeout(Duration::from_secs(2));

        connector.check_reachable(&open).await.unwrap();
        assert!(connector.check_reachable(&closed).await.is_err());
    }
}
