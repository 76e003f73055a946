//! Line-oriented control-port session.
//!
//! Replies are sequences of `NNN<sep>text` lines. `-` marks a mid-reply line,
//! `+` starts a data block that runs until a lone `.`, and a space ends the
//! reply. `250` is success; `4xx`/`5xx` end the reply as an error.

use std::time::Duration;

use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::debug;

/// Success status code.
pub const STATUS_OK: u16 = 250;

/// Control-protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control channel closed")]
    ChannelClosed,
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("authentication rejected: {0}")]
    AuthenticationFailed(String),
    #[error("command rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
    #[error("malformed reply line: {0}")]
    Protocol(String),
    #[error("timed out connecting to control port {0}")]
    ConnectTimeout(u16),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One logical line of a reply (data blocks are folded into `data`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub text: String,
    pub data: Option<String>,
}

/// A complete successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub code: u16,
    pub lines: Vec<ReplyLine>,
}

impl ControlReply {
    /// Look up `key` in `key=value` lines or `key=` data blocks.
    pub fn value(&self, key: &str) -> Option<String> {
        let prefix = format!("{}=", key);
        self.lines.iter().find_map(|line| {
            let rest = line.text.strip_prefix(&prefix)?;
            match line.data {
                Some(ref data) => Some(data.clone()),
                None => Some(rest.trim_matches('"').to_string()),
            }
        })
    }

    /// Text of the final line (usually `OK`).
    pub fn status_text(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }
}

/// Request/response session with the daemon's control port.
pub struct ControlChannel<S = TcpStream> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    authenticated: bool,
}

impl ControlChannel<TcpStream> {
    /// Connect to the control port on loopback.
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self, ControlError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| ControlError::ConnectTimeout(port))??;
        Ok(Self::new(stream))
    }
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let (read, write) = split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Authenticate with the cookie bytes, or with no credential.
    pub async fn authenticate(&mut self, cookie: Option<&[u8]>) -> Result<(), ControlError> {
        let command = match cookie {
            Some(bytes) => format!("AUTHENTICATE {}", hex::encode(bytes)),
            None => "AUTHENTICATE".to_string(),
        };
        match self.exchange(&command).await {
            Ok(_) => {
                self.authenticated = true;
                Ok(())
            }
            Err(ControlError::Rejected { message, .. }) => {
                Err(ControlError::AuthenticationFailed(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Send a command on an authenticated session and read its reply.
    pub async fn send(&mut self, command: &str) -> Result<ControlReply, ControlError> {
        if !self.authenticated {
            return Err(ControlError::NotAuthenticated);
        }
        self.exchange(command).await
    }

    async fn exchange(&mut self, command: &str) -> Result<ControlReply, ControlError> {
        debug!(
            "control > {}",
            command.split_whitespace().next().unwrap_or_default()
        );
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ControlError::ChannelClosed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<ControlReply, ControlError> {
        let mut lines = Vec::new();
        loop {
            let raw = self.read_line().await?;
            let (code, sep, text) = parse_status_line(&raw)?;

            match sep {
                '-' => lines.push(ReplyLine {
                    text: text.to_string(),
                    data: None,
                }),
                '+' => {
                    let data = self.read_data_block().await?;
                    lines.push(ReplyLine {
                        text: text.to_string(),
                        data: Some(data),
                    });
                }
                _ => {
                    if code != STATUS_OK {
                        return Err(ControlError::Rejected {
                            code,
                            message: text.to_string(),
                        });
                    }
                    lines.push(ReplyLine {
                        text: text.to_string(),
                        data: None,
                    });
                    return Ok(ControlReply { code, lines });
                }
            }
        }
    }

    async fn read_data_block(&mut self) -> Result<String, ControlError> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(body.join("\n"));
            }
            // Dot-stuffed lines carry a leading extra '.'.
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
            body.push(line);
        }
    }
}

/// Split `250-text` into its code, separator and text.
fn parse_status_line(line: &str) -> Result<(u16, char, &str), ControlError> {
    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        return Err(ControlError::Protocol(line.to_string()));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| ControlError::Protocol(line.to_string()))?;
    let sep = line[3..4]
        .chars()
        .next()
        .ok_or_else(|| ControlError::Protocol(line.to_string()))?;
    if !matches!(sep, '-' | '+' | ' ') {
        return Err(ControlError::Protocol(line.to_string()));
    }
    Ok((code, sep, &line[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Fake control port: answers each received line with the next canned
    /// response, then closes.
    fn fake_port(responses: Vec<&'static str>) -> (ControlChannel<tokio::io::DuplexStream>, tokio::task::JoinHandle<Vec<String>>) {
        let (client, server) = duplex(4096);
        let handle = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut reader = BufReader::new(read);
            let mut received = Vec::new();
            for response in responses {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                write.write_all(response.as_bytes()).await.unwrap();
            }
            received
        });
        (ControlChannel::new(client), handle)
    }

    #[tokio::test]
    async fn test_commands_require_authentication() {
        let (mut channel, _server) = fake_port(vec![]);
        let err = channel.send("SIGNAL NEWNYM").await.unwrap_err();
        assert!(matches!(err, ControlError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_cookie_authentication_sends_hex() {
        let (mut channel, server) = fake_port(vec!["250 OK\r\n", "250 OK\r\n"]);
        channel.authenticate(Some(&[0xde, 0xad, 0xbe, 0xef])).await.unwrap();
        assert!(channel.is_authenticated());

        let reply = channel.send("SIGNAL NEWNYM").await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.status_text(), "OK");

        drop(channel);
        let received = server.await.unwrap();
        assert_eq!(received, vec!["AUTHENTICATE deadbeef", "SIGNAL NEWNYM"]);
    }

    #[tokio::test]
    async fn test_rejected_authentication() {
        let (mut channel, _server) =
            fake_port(vec!["515 Authentication failed: Wrong length on authentication cookie.\r\n"]);
        let err = channel.authenticate(Some(b"bad")).await.unwrap_err();
        assert!(matches!(err, ControlError::AuthenticationFailed(_)));
        assert!(!channel.is_authenticated());
    }

    #[tokio::test]
    async fn test_multiline_and_data_block_reply() {
        let (mut channel, _server) = fake_port(vec![
            "250 OK\r\n",
            "250+circuit-status=\r\n1 BUILT $AAA~relay1,$BBB~relay2 PURPOSE=GENERAL\r\n..dotted\r\n.\r\n250-net/listeners/socks=\"127.0.0.1:9050\"\r\n250 OK\r\n",
        ]);
        channel.authenticate(None).await.unwrap();

        let reply = channel
            .send("GETINFO circuit-status net/listeners/socks")
            .await
            .unwrap();
        assert_eq!(
            reply.value("circuit-status").as_deref(),
            Some("1 BUILT $AAA~relay1,$BBB~relay2 PURPOSE=GENERAL\n.dotted")
        );
        assert_eq!(
            reply.value("net/listeners/socks").as_deref(),
            Some("127.0.0.1:9050")
        );
    }

    #[tokio::test]
    async fn test_error_reply() {
        let (mut channel, _server) =
            fake_port(vec!["250 OK\r\n", "552 Unrecognized key \"bogus\"\r\n"]);
        channel.authenticate(None).await.unwrap();
        let err = channel.send("GETINFO bogus").await.unwrap_err();
        match err {
            ControlError::Rejected { code, .. } => assert_eq!(code, 552),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_closed_mid_reply() {
        let (mut channel, _server) = fake_port(vec!["250 OK\r\n", "250-partial=1\r\n"]);
        channel.authenticate(None).await.unwrap();
        let err = channel.send("GETINFO partial").await.unwrap_err();
        assert!(matches!(err, ControlError::ChannelClosed));
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("250 OK").unwrap(), (250, ' ', "OK"));
        assert_eq!(parse_status_line("250-a=b").unwrap(), (250, '-', "a=b"));
        assert!(parse_status_line("25").is_err());
        assert!(parse_status_line("abc OK").is_err());
        assert!(parse_status_line("250?x").is_err());
    }
}
