//! Proxy hop descriptors.

use serde::{Deserialize, Serialize};
use url::Url;

use super::ChainError;

/// Wire protocol spoken by a hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Socks5,
    Shadowsocks,
    V2ray,
    Trojan,
}

impl Protocol {
    /// Protocols cheap enough for latency-sensitive chains.
    pub fn is_low_latency(self) -> bool {
        matches!(self, Protocol::Socks5 | Protocol::Shadowsocks)
    }

    /// Protocols preferred on the exit of throughput-oriented chains.
    pub fn is_high_throughput(self) -> bool {
        matches!(self, Protocol::Shadowsocks | Protocol::V2ray)
    }

    /// Parse a URI scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "socks5" | "socks5h" | "socks" => Some(Protocol::Socks5),
            "ss" | "shadowsocks" => Some(Protocol::Shadowsocks),
            "vmess" | "vless" | "v2ray" => Some(Protocol::V2ray),
            "trojan" => Some(Protocol::Trojan),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Socks5 => write!(f, "socks5"),
            Protocol::Shadowsocks => write!(f, "shadowsocks"),
            Protocol::V2ray => write!(f, "v2ray"),
            Protocol::Trojan => write!(f, "trojan"),
        }
    }
}

/// Position of a hop within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HopRole {
    Entry,
    #[default]
    Middle,
    Exit,
    /// Single-hop chain: both entry and exit.
    EntryExit,
}

impl HopRole {
    /// Role for `index` in a chain of `len` hops.
    pub fn for_position(index: usize, len: usize) -> Self {
        match (index, len) {
            (_, 1) => HopRole::EntryExit,
            (0, _) => HopRole::Entry,
            (i, n) if i + 1 == n => HopRole::Exit,
            _ => HopRole::Middle,
        }
    }

    pub fn is_entry(self) -> bool {
        matches!(self, HopRole::Entry | HopRole::EntryExit)
    }

    pub fn is_exit(self) -> bool {
        matches!(self, HopRole::Exit | HopRole::EntryExit)
    }
}

impl std::fmt::Display for HopRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HopRole::Entry => write!(f, "entry"),
            HopRole::Middle => write!(f, "middle"),
            HopRole::Exit => write!(f, "exit"),
            HopRole::EntryExit => write!(f, "entry+exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityTier {
    #[default]
    Standard,
    High,
    Maximum,
}

/// Username/password pair. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One server in a chain. Never edited in place once part of a chain;
/// rotation builds new hops instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHop {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// ISO 3166-1 alpha-2 code, uppercase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Cipher name (shadowsocks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
    #[serde(default)]
    pub role: HopRole,
    #[serde(default)]
    pub obfuscated: bool,
    #[serde(default)]
    pub tier: SecurityTier,
}

impl ProxyHop {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}:{}", protocol, host, port),
            name: host.clone(),
            protocol,
            host,
            port,
            country: None,
            credentials: None,
            cipher: None,
            role: HopRole::default(),
            obfuscated: false,
            tier: SecurityTier::default(),
        }
    }

    pub fn with_country(mut self, country: &str) -> Self {
        self.country = Some(country.to_uppercase());
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    pub fn with_cipher(mut self, cipher: &str) -> Self {
        self.cipher = Some(cipher.to_string());
        self
    }

    pub fn with_role(mut self, role: HopRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_obfuscation(mut self, obfuscated: bool) -> Self {
        self.obfuscated = obfuscated;
        self
    }

    pub fn with_tier(mut self, tier: SecurityTier) -> Self {
        self.tier = tier;
        self
    }

    /// `host:port` for dialing and log lines.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parse a server URI.
    ///
    /// Supported forms:
    /// - `socks5://[user:pass@]host:port[#name]`
    /// - `ss://cipher:password@host:port[#name]`
    /// - `vmess://uuid@host:port`, `trojan://password@host:port`
    ///
    /// Query parameters `country=XX` and `obfs=1` set the country and
    /// obfuscation flag.
    pub fn from_uri(uri: &str) -> Result<Self, ChainError> {
        let url = Url::parse(uri).map_err(|e| ChainError::InvalidServer(format!("{uri}: {e}")))?;
        let protocol = Protocol::from_scheme(url.scheme()).ok_or_else(|| {
            ChainError::InvalidServer(format!("unsupported scheme '{}'", url.scheme()))
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| ChainError::InvalidServer(format!("{uri}: missing host")))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| ChainError::InvalidServer(format!("{uri}: missing port")))?;

        let mut hop = ProxyHop::new(protocol, host, port);

        let username = decode(url.username());
        let password = url.password().map(decode);
        match (protocol, password) {
            (Protocol::Shadowsocks, Some(password)) => {
                hop.cipher = Some(username);
                hop.credentials = Some(Credentials {
                    username: String::new(),
                    password,
                });
            }
            (_, Some(password)) => {
                hop.credentials = Some(Credentials { username, password });
            }
            (_, None) if !username.is_empty() => {
                hop.credentials = Some(Credentials {
                    username: String::new(),
                    password: username,
                });
            }
            _ => {}
        }

        if let Some(fragment) = url.fragment() {
            if !fragment.is_empty() {
                hop.name = decode(fragment);
            }
        }
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "country" => hop.country = Some(value.to_uppercase()),
                "obfs" => hop.obfuscated = value == "1" || value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Ok(hop)
    }

    /// Fill in derived fields left empty by a config file.
    pub fn normalized(mut self) -> Self {
        if self.id.is_empty() {
            self.id = format!("{}:{}:{}", self.protocol, self.host, self.port);
        }
        if self.name.is_empty() {
            self.name = self.host.clone();
        }
        if let Some(ref c) = self.country {
            self.country = Some(c.to_uppercase());
        }
        self
    }
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// A pool entry in the config file: either a URI or a structured hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerEntry {
    Uri(String),
    Hop(ProxyHop),
}

impl ServerEntry {
    pub fn to_hop(&self) -> Result<ProxyHop, ChainError> {
        match self {
            ServerEntry::Uri(uri) => ProxyHop::from_uri(uri),
            ServerEntry::Hop(hop) => Ok(hop.clone().normalized()),
        }
    }
}
