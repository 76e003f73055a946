//! Loopback fakes shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use veilnet::chain::{Protocol, ProxyHop};

/// How a fake hop answers the method negotiation.
#[derive(Debug, Clone, Copy)]
pub enum Auth {
    None,
    Password(&'static str, &'static str),
    RejectAll,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub accepted: AtomicUsize,
    pub closed: AtomicUsize,
    pub connects: Mutex<Vec<String>>,
}

impl Stats {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

pub struct FakeSocks {
    pub hop: ProxyHop,
    pub stats: Arc<Stats>,
}

/// SOCKS5 server that really relays CONNECT requests, so hops can be chained.
pub async fn spawn_socks(auth: Auth) -> FakeSocks {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stats = Arc::new(Stats::default());

    let server_stats = stats.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            server_stats.accepted.fetch_add(1, Ordering::SeqCst);
            let stats = server_stats.clone();
            tokio::spawn(async move {
                let _ = session(stream, auth, &stats).await;
                stats.closed.fetch_add(1, Ordering::SeqCst);
            });
        }
    });

    FakeSocks {
        hop: ProxyHop::new(Protocol::Socks5, "127.0.0.1", port),
        stats,
    }
}

async fn session(mut stream: TcpStream, auth: Auth, stats: &Stats) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    match auth {
        Auth::None if methods.contains(&0x00) => stream.write_all(&[0x05, 0x00]).await?,
        Auth::Password(user, pass) if methods.contains(&0x02) => {
            stream.write_all(&[0x05, 0x02]).await?;
            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await?;
            let mut username = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut username).await?;
            let plen = stream.read_u8().await?;
            let mut password = vec![0u8; plen as usize];
            stream.read_exact(&mut password).await?;
            if username != user.as_bytes() || password != pass.as_bytes() {
                stream.write_all(&[0x01, 0x01]).await?;
                return Ok(());
            }
            stream.write_all(&[0x01, 0x00]).await?;
        }
        _ => {
            stream.write_all(&[0x05, 0xFF]).await?;
            return Ok(());
        }
    }

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let host = match request[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let port = stream.read_u16().await?;
    stats.connects.lock().unwrap().push(format!("{}:{}", host, port));

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(s) => s,
        Err(_) => {
            stream
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }
    };
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    Ok(())
}

/// Echo server for end-to-end checks.
pub async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
