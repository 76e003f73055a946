//! Byte streams and live per-hop connections.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::ProxyHop;

/// Anything a hop can run over: a TCP socket, or a stream already tunnelled
/// through earlier hops.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

pub type BoxedStream = Box<dyn ProxyStream>;

impl std::fmt::Debug for dyn ProxyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProxyStream")
    }
}

/// Opens direct transport connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<BoxedStream>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> std::io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// A hop's live transport.
///
/// When the next hop is tunnelled through this one, the stream moves forward
/// into the next connection and this one keeps only its bookkeeping.
/// [`close`](Self::close) consumes the connection, so it can run at most once.
pub struct ProxyConnection {
    hop: ProxyHop,
    index: usize,
    stream: Option<BoxedStream>,
    forwarded: bool,
    opened_at: Instant,
}

impl ProxyConnection {
    pub(crate) fn new(hop: ProxyHop, index: usize, stream: BoxedStream) -> Self {
        Self {
            hop,
            index,
            stream: Some(stream),
            forwarded: false,
            opened_at: Instant::now(),
        }
    }

    pub fn hop(&self) -> &ProxyHop {
        &self.hop
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this hop's stream now belongs to a later hop.
    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    pub fn age(&self) -> std::time::Duration {
        self.opened_at.elapsed()
    }

    /// Whether this connection still holds the chain's live stream.
    pub fn owns_stream(&self) -> bool {
        self.stream.is_some()
    }

    /// Check the live stream without blocking. An idle chain has nothing to
    /// read, so EOF, an error or unsolicited bytes all mean the link is gone.
    /// `None` when the stream has moved to a later hop.
    pub(crate) async fn check_link(&mut self) -> Option<io::Result<()>> {
        let stream = self.stream.as_mut()?;
        let mut byte = [0u8; 1];
        // A zero timeout polls the read exactly once.
        let result = match tokio::time::timeout(Duration::ZERO, stream.read(&mut byte)).await {
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "link closed by peer",
            )),
            Ok(Ok(_)) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected data on idle link",
            )),
            Ok(Err(e)) => Err(e),
        };
        Some(result)
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut BoxedStream> {
        self.stream.as_mut()
    }

    /// Hand the stream to the next hop.
    pub(crate) fn forward_stream(&mut self) -> Option<BoxedStream> {
        let stream = self.stream.take();
        if stream.is_some() {
            self.forwarded = true;
        }
        stream
    }

    /// Take the stream for end-to-end use (relay traffic).
    pub(crate) fn into_stream(mut self) -> Option<BoxedStream> {
        self.stream.take()
    }

    /// Shut the stream down if this connection still owns it.
    pub async fn close(mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Hop {} shutdown error: {}", self.index, e);
            }
        }
        debug!(
            "Closed hop {} ({}) after {}ms",
            self.index,
            self.hop.address(),
            self.opened_at.elapsed().as_millis()
        );
    }
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection")
            .field("hop", &self.hop.id)
            .field("index", &self.index)
            .field("owns_stream", &self.owns_stream())
            .field("forwarded", &self.forwarded)
            .finish()
    }
}
