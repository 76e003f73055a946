//! Routing modes.

use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// User-selected routing mode. Fixed for the lifetime of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Fast: at most three low-latency hops, no obfuscation.
    Turbo,
    /// The caller's own ordered server list.
    Custom,
    /// Maximum anonymity: 5-7 hops across distinct countries.
    Ghost,
    /// Censorship resistant: obfuscated entry, throughput-oriented exit.
    Stealth,
    /// Maximum security: 6-7 hops outside surveillance-alliance countries.
    Paranoid,
    /// Route through the anonymity daemon instead of a proxy chain.
    #[serde(alias = "daemon")]
    DaemonBacked,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Mode::Turbo,
        Mode::Custom,
        Mode::Ghost,
        Mode::Stealth,
        Mode::Paranoid,
        Mode::DaemonBacked,
    ];

    /// Whether this mode is served by a proxy chain.
    pub fn uses_chain(self) -> bool {
        self != Mode::DaemonBacked
    }

    /// Allowed hop count before capping to the pool size.
    pub fn hop_range(self) -> RangeInclusive<usize> {
        match self {
            Mode::Turbo => 1..=3,
            Mode::Custom => 1..=usize::MAX,
            Mode::Ghost => 5..=7,
            Mode::Stealth => 3..=4,
            Mode::Paranoid => 6..=7,
            Mode::DaemonBacked => 0..=0,
        }
    }

    /// Obfuscation forced onto every hop, or `None` to keep each hop's flag.
    pub fn obfuscation(self) -> Option<bool> {
        match self {
            Mode::Turbo => Some(false),
            Mode::Ghost | Mode::Stealth | Mode::Paranoid => Some(true),
            Mode::Custom | Mode::DaemonBacked => None,
        }
    }

    /// Random pause range between hop connections, in milliseconds.
    pub fn inter_hop_delay_ms(self) -> RangeInclusive<u64> {
        match self {
            Mode::Turbo => 100..=300,
            Mode::Custom => 200..=800,
            Mode::Stealth => 300..=1200,
            Mode::Ghost => 500..=1500,
            Mode::Paranoid => 800..=2000,
            Mode::DaemonBacked => 0..=0,
        }
    }

    /// Periodic full-rotation interval, if the mode rotates at all.
    pub fn rotation_interval(self, standard: Duration, paranoid: Duration) -> Option<Duration> {
        match self {
            Mode::Ghost | Mode::Stealth => Some(standard),
            Mode::Paranoid => Some(paranoid),
            Mode::Turbo | Mode::Custom | Mode::DaemonBacked => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Turbo => write!(f, "turbo"),
            Mode::Custom => write!(f, "custom"),
            Mode::Ghost => write!(f, "ghost"),
            Mode::Stealth => write!(f, "stealth"),
            Mode::Paranoid => write!(f, "paranoid"),
            Mode::DaemonBacked => write!(f, "daemon-backed"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "turbo" | "fast" => Ok(Mode::Turbo),
            "custom" => Ok(Mode::Custom),
            "ghost" => Ok(Mode::Ghost),
            "stealth" => Ok(Mode::Stealth),
            "paranoid" => Ok(Mode::Paranoid),
            "daemon" | "daemon-backed" | "tor" => Ok(Mode::DaemonBacked),
            other => Err(format!(
                "unknown mode '{}' (expected turbo, custom, ghost, stealth, paranoid or daemon)",
                other
            )),
        }
    }
}
