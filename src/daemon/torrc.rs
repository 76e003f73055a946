//! Runtime configuration file for the daemon.

use std::path::{Path, PathBuf};

/// Cookie file name, written by the daemon next to its data directory.
pub const COOKIE_FILE: &str = "control_auth_cookie";

/// A pluggable-transport helper that was found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPlugin {
    /// Transport name as used in bridge lines (`obfs4`, `snowflake`, ...).
    pub name: String,
    pub path: PathBuf,
}

/// Inputs for one generated runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig<'a> {
    pub data_dir: &'a Path,
    pub socks_port: u16,
    pub dns_port: u16,
    pub control_port: u16,
    /// `Some` when bridges are requested. Only transports with a helper on
    /// disk appear here.
    pub transports: Option<&'a [TransportPlugin]>,
    pub bridge_lines: &'a [String],
}

impl RuntimeConfig<'_> {
    pub fn cookie_path(&self) -> PathBuf {
        self.data_dir.join(COOKIE_FILE)
    }

    /// Render the configuration text.
    pub fn render(&self) -> String {
        let mut out = format!(
            r#"# veilnet daemon configuration
# Auto-generated on every start - do not edit manually

DataDirectory {data_dir}
SocksPort 127.0.0.1:{socks_port}
DNSPort 127.0.0.1:{dns_port}
ControlPort 127.0.0.1:{control_port}
CookieAuthentication 1
CookieAuthFile {cookie}

# Logging
Log notice stdout

# Mobile storage
AvoidDiskWrites 1
"#,
            data_dir = self.data_dir.display(),
            socks_port = self.socks_port,
            dns_port = self.dns_port,
            control_port = self.control_port,
            cookie = self.cookie_path().display(),
        );

        if let Some(transports) = self.transports {
            let bridges = usable_bridges(self.bridge_lines, transports);
            // Without a bridge line the daemon would never bootstrap.
            if !bridges.is_empty() {
                out.push_str("\n# Bridges\nUseBridges 1\n");
                for plugin in transports {
                    out.push_str(&format!(
                        "ClientTransportPlugin {} exec {}\n",
                        plugin.name,
                        plugin.path.display()
                    ));
                }
                for line in bridges {
                    out.push_str(&format!("Bridge {}\n", line));
                }
            }
        }

        out
    }
}

/// Bridge lines that can be used with `transports`, trimmed.
pub fn usable_bridges<'a>(lines: &'a [String], transports: &[TransportPlugin]) -> Vec<&'a str> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| bridge_usable(line, transports))
        .collect()
}

/// A bridge line is usable when it is a plain `ip:port` bridge or names a
/// transport whose helper is available.
fn bridge_usable(line: &str, transports: &[TransportPlugin]) -> bool {
    let Some(first) = line.split_whitespace().next() else {
        return false;
    };
    if first.contains(':') {
        return true;
    }
    transports.iter().any(|t| t.name == first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_without_bridges() {
        let dir = PathBuf::from("/data/daemon");
        let config = RuntimeConfig {
            data_dir: &dir,
            socks_port: 9050,
            dns_port: 5400,
            control_port: 9051,
            transports: None,
            bridge_lines: &["obfs4 1.2.3.4:443 FP cert=x iat-mode=0".to_string()],
        };
        let torrc = config.render();

        assert!(torrc.contains("SocksPort 127.0.0.1:9050"));
        assert!(torrc.contains("DNSPort 127.0.0.1:5400"));
        assert!(torrc.contains("ControlPort 127.0.0.1:9051"));
        assert!(torrc.contains("CookieAuthentication 1"));
        assert!(torrc.contains("CookieAuthFile /data/daemon/control_auth_cookie"));
        assert!(!torrc.contains("UseBridges"));
        assert!(!torrc.contains("Bridge "));
    }

    #[test]
    fn test_render_only_found_transports() {
        let dir = PathBuf::from("/data/daemon");
        let transports = vec![TransportPlugin {
            name: "obfs4".to_string(),
            path: PathBuf::from("/lib/arm64-v8a/libobfs4proxy.so"),
        }];
        let bridges = vec![
            "obfs4 1.2.3.4:443 FP cert=x iat-mode=0".to_string(),
            "snowflake 192.0.2.3:80 FP".to_string(),
            "5.6.7.8:9001".to_string(),
        ];
        let config = RuntimeConfig {
            data_dir: &dir,
            socks_port: 9050,
            dns_port: 5400,
            control_port: 9051,
            transports: Some(&transports),
            bridge_lines: &bridges,
        };
        let torrc = config.render();

        assert!(torrc.contains("UseBridges 1"));
        assert!(torrc.contains("ClientTransportPlugin obfs4 exec /lib/arm64-v8a/libobfs4proxy.so"));
        assert!(!torrc.contains("snowflake"));
        assert!(torrc.contains("Bridge obfs4 1.2.3.4:443"));
        assert!(torrc.contains("Bridge 5.6.7.8:9001"));
    }

    #[test]
    fn test_bridges_omitted_without_usable_line() {
        let dir = PathBuf::from("/data/daemon");
        let bridges = vec!["snowflake 192.0.2.3:80 FP".to_string(), "  ".to_string()];
        let config = RuntimeConfig {
            data_dir: &dir,
            socks_port: 9050,
            dns_port: 5400,
            control_port: 9051,
            transports: Some(&[][..]),
            bridge_lines: &bridges,
        };
        let torrc = config.render();

        assert!(!torrc.contains("UseBridges"));
        assert!(!torrc.contains("Bridge "));
        assert!(usable_bridges(&bridges, &[]).is_empty());
    }
}
