//! SOCKS5 (RFC 1928) and username/password (RFC 1929) wire helpers.
//!
//! Client side is used by the connector for socks5 hops and for CONNECTs
//! tunnelled through them; server side by the local relay.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::Credentials;

/// SOCKS protocol version 5
pub const VERSION: u8 = 0x05;

/// Authentication methods
pub mod auth {
    pub const NO_AUTH: u8 = 0x00;
    pub const USERNAME_PASSWORD: u8 = 0x02;
    pub const NO_ACCEPTABLE: u8 = 0xFF;
    /// Username/password sub-negotiation version
    pub const SUBNEG_VERSION: u8 = 0x01;
}

pub mod command {
    pub const CONNECT: u8 = 0x01;
}

/// Address types for SOCKS5 requests
pub mod addr_type {
    pub const IPV4: u8 = 0x01;
    pub const DOMAIN: u8 = 0x03;
    pub const IPV6: u8 = 0x04;
}

/// Reply codes from SOCKS5 server
pub mod reply {
    pub const SUCCESS: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_NOT_SUPPORTED: u8 = 0x08;
    /// Reserved byte (always 0x00)
    pub const RESERVED: u8 = 0x00;
}

#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected SOCKS version 0x{0:02x}")]
    BadVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("server chose unsupported method 0x{0:02x}")]
    UnsupportedMethod(u8),
    #[error("server requires credentials but none were configured")]
    CredentialsRequired,
    #[error("authentication rejected (status 0x{0:02x})")]
    AuthRejected(u8),
    #[error("{0} exceeds 255 bytes")]
    TooLong(&'static str),
    #[error("{} (code 0x{:02x})", reply_message(.0), .0)]
    Reply(u8),
    #[error("unknown address type 0x{0:02x}")]
    BadAddressType(u8),
    #[error("unsupported command 0x{0:02x}")]
    BadCommand(u8),
}

fn reply_message(code: &u8) -> &'static str {
    match *code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS error",
    }
}

/// Method negotiation plus optional username/password sub-negotiation.
pub async fn negotiate<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut methods = vec![auth::NO_AUTH];
    if credentials.is_some() {
        methods.push(auth::USERNAME_PASSWORD);
    }
    let mut greeting = vec![VERSION, methods.len() as u8];
    greeting.extend_from_slice(&methods);
    stream.write_all(&greeting).await?;
    stream.flush().await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != VERSION {
        return Err(Socks5Error::BadVersion(response[0]));
    }

    match response[1] {
        auth::NO_AUTH => Ok(()),
        auth::USERNAME_PASSWORD => {
            let creds = credentials.ok_or(Socks5Error::CredentialsRequired)?;
            authenticate(stream, creds).await
        }
        auth::NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableMethod),
        other => Err(Socks5Error::UnsupportedMethod(other)),
    }
}

async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let user = creds.username.as_bytes();
    let pass = creds.password.as_bytes();
    if user.len() > 255 {
        return Err(Socks5Error::TooLong("username"));
    }
    if pass.len() > 255 {
        return Err(Socks5Error::TooLong("password"));
    }

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(auth::SUBNEG_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user);
    request.push(pass.len() as u8);
    request.extend_from_slice(pass);
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != auth::SUBNEG_VERSION {
        return Err(Socks5Error::BadVersion(response[0]));
    }
    if response[1] != 0x00 {
        return Err(Socks5Error::AuthRejected(response[1]));
    }
    debug!("SOCKS5 username/password accepted");
    Ok(())
}

/// Encode `ATYP | ADDR | PORT` for a host that may be an IP literal or a name.
fn encode_address(host: &str, port: u16, out: &mut Vec<u8>) -> Result<(), Socks5Error> {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(addr_type::IPV4);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(addr_type::IPV6);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let name = host.as_bytes();
            if name.len() > 255 {
                return Err(Socks5Error::TooLong("hostname"));
            }
            out.push(addr_type::DOMAIN);
            out.push(name.len() as u8);
            out.extend_from_slice(name);
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// Issue CONNECT for `host:port` and consume the reply including its bound
/// address, leaving the stream positioned at the tunnelled payload.
pub async fn connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut request = vec![VERSION, command::CONNECT, reply::RESERVED];
    encode_address(host, port, &mut request)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::BadVersion(header[0]));
    }
    if header[1] != reply::SUCCESS {
        return Err(Socks5Error::Reply(header[1]));
    }
    let (_, _) = read_address(stream, header[3]).await?;
    debug!("SOCKS5 CONNECT {}:{} established", host, port);
    Ok(())
}

async fn read_address<S>(stream: &mut S, atyp: u8) -> Result<(String, u16), Socks5Error>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let host = match atyp {
        addr_type::IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        addr_type::IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        addr_type::DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        other => return Err(Socks5Error::BadAddressType(other)),
    };
    let port = stream.read_u16().await?;
    Ok((host, port))
}

/// Server side: read the greeting and accept without authentication.
pub async fn accept_greeting<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(Socks5Error::BadVersion(version));
    }
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&auth::NO_AUTH) {
        stream.write_all(&[VERSION, auth::NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, auth::NO_AUTH]).await?;
    Ok(())
}

/// Server side: read a CONNECT request, returning the destination.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<(String, u16), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::BadVersion(header[0]));
    }
    if header[1] != command::CONNECT {
        write_reply(stream, reply::COMMAND_NOT_SUPPORTED).await?;
        return Err(Socks5Error::BadCommand(header[1]));
    }
    match read_address(stream, header[3]).await {
        Ok(dest) => Ok(dest),
        Err(Socks5Error::BadAddressType(atyp)) => {
            write_reply(stream, reply::ADDRESS_NOT_SUPPORTED).await?;
            Err(Socks5Error::BadAddressType(atyp))
        }
        Err(e) => Err(e),
    }
}

/// Server side: reply with `code` and an unspecified bound address.
pub async fn write_reply<S>(stream: &mut S, code: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&[
            VERSION,
            code,
            reply::RESERVED,
            addr_type::IPV4,
            0,
            0,
            0,
            0, // bound address (0.0.0.0)
            0,
            0, // bound port (0)
        ])
        .await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_client_and_server_agree() {
        let (mut client, mut server) = duplex(1024);

        let server_task = tokio::spawn(async move {
            accept_greeting(&mut server).await.unwrap();
            let dest = read_connect_request(&mut server).await.unwrap();
            write_reply(&mut server, reply::SUCCESS).await.unwrap();
            dest
        });

        negotiate(&mut client, None).await.unwrap();
        connect(&mut client, "example.org", 443).await.unwrap();

        let (host, port) = server_task.await.unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_ipv4_destination_encoding() {
        let mut buf = Vec::new();
        encode_address("10.1.2.3", 8080, &mut buf).unwrap();
        assert_eq!(buf, vec![addr_type::IPV4, 10, 1, 2, 3, 0x1f, 0x90]);
    }

    #[tokio::test]
    async fn test_password_subnegotiation() {
        let (mut client, mut server) = duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION, 2, auth::NO_AUTH, auth::USERNAME_PASSWORD]);
            server
                .write_all(&[VERSION, auth::USERNAME_PASSWORD])
                .await
                .unwrap();

            let ver = server.read_u8().await.unwrap();
            assert_eq!(ver, auth::SUBNEG_VERSION);
            let ulen = server.read_u8().await.unwrap() as usize;
            let mut user = vec![0u8; ulen];
            server.read_exact(&mut user).await.unwrap();
            let plen = server.read_u8().await.unwrap() as usize;
            let mut pass = vec![0u8; plen];
            server.read_exact(&mut pass).await.unwrap();
            let ok = user == b"alice" && pass == b"secret";
            server
                .write_all(&[auth::SUBNEG_VERSION, if ok { 0 } else { 1 }])
                .await
                .unwrap();
        });

        let creds = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        negotiate(&mut client, Some(&creds)).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_connect_reports_reply_code() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            accept_greeting(&mut server).await.unwrap();
            let _ = read_connect_request(&mut server).await.unwrap();
            write_reply(&mut server, reply::CONNECTION_REFUSED).await.unwrap();
        });

        negotiate(&mut client, None).await.unwrap();
        let err = connect(&mut client, "10.0.0.1", 80).await.unwrap_err();
        assert!(matches!(err, Socks5Error::Reply(reply::CONNECTION_REFUSED)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_password_required_without_credentials() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server
                .write_all(&[VERSION, auth::USERNAME_PASSWORD])
                .await
                .unwrap();
        });
        let err = negotiate(&mut client, None).await.unwrap_err();
        assert!(matches!(err, Socks5Error::CredentialsRequired));
    }
}
