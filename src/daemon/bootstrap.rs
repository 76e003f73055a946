//! Bootstrap progress extraction from daemon output.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// What a single output line means for startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Progress(u8),
    Fatal,
    Warning,
    Other,
}

fn bootstrap_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Bootstrapped (\d{1,3})%").expect("static regex"))
}

/// Classify a daemon log line.
pub fn classify(line: &str) -> LineKind {
    if let Some(caps) = bootstrap_pattern().captures(line) {
        if let Ok(pct) = caps[1].parse::<u8>() {
            if pct <= 100 {
                return LineKind::Progress(pct);
            }
        }
    }
    if line.contains("[err]") {
        LineKind::Fatal
    } else if line.contains("[warn]") {
        LineKind::Warning
    } else {
        LineKind::Other
    }
}

/// How the bootstrap wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Ready,
    Fatal(String),
    TimedOut { last_percent: u8 },
    OutputClosed { last_percent: u8 },
}

/// Consume output lines until 100%, a fatal line, EOF or `timeout`.
///
/// `percent` only ever moves forward; `on_progress` fires once per increase.
pub async fn wait_for_bootstrap<F>(
    output: &mut mpsc::Receiver<String>,
    timeout: Duration,
    percent: &watch::Sender<u8>,
    mut on_progress: F,
) -> BootstrapOutcome
where
    F: FnMut(u8),
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let line = match tokio::time::timeout_at(deadline, output.recv()).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return BootstrapOutcome::OutputClosed {
                    last_percent: *percent.borrow(),
                }
            }
            Err(_) => {
                return BootstrapOutcome::TimedOut {
                    last_percent: *percent.borrow(),
                }
            }
        };

        match classify(&line) {
            LineKind::Progress(pct) => {
                let advanced = percent.send_if_modified(|current| {
                    if pct > *current {
                        *current = pct;
                        true
                    } else {
                        false
                    }
                });
                if advanced {
                    debug!("Daemon bootstrap {}%", pct);
                    on_progress(pct);
                }
                if pct == 100 {
                    return BootstrapOutcome::Ready;
                }
            }
            LineKind::Fatal => {
                warn!("Daemon: {}", line);
                return BootstrapOutcome::Fatal(line);
            }
            LineKind::Warning => warn!("Daemon: {}", line),
            LineKind::Other => debug!("Daemon: {}", line),
        }
    }
}

/// Keep draining daemon output after startup so the pipe never fills.
pub async fn drain_output(mut output: mpsc::Receiver<String>) {
    while let Some(line) = output.recv().await {
        match classify(&line) {
            LineKind::Fatal | LineKind::Warning => warn!("Daemon: {}", line),
            _ => debug!("Daemon: {}", line),
        }
    }
    debug!("Daemon output closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify("Jan 01 00:00:00.000 [notice] Bootstrapped 37% (loading_descriptors): Loading relay descriptors"),
            LineKind::Progress(37)
        );
        assert_eq!(
            classify("[notice] Bootstrapped 100% (done): Done"),
            LineKind::Progress(100)
        );
        assert_eq!(classify("[err] Reading config failed"), LineKind::Fatal);
        assert_eq!(classify("[warn] Clock skew"), LineKind::Warning);
        assert_eq!(classify("[notice] Opening Socks listener"), LineKind::Other);
        assert_eq!(classify("Bootstrapped 250%"), LineKind::Other);
    }

    async fn run(lines: &[&str], close: bool, timeout_ms: u64) -> (BootstrapOutcome, Vec<u8>, u8) {
        let (tx, mut rx) = mpsc::channel(16);
        for line in lines {
            tx.send(line.to_string()).await.unwrap();
        }
        let _keep = if close {
            drop(tx);
            None
        } else {
            Some(tx)
        };
        let (percent, watcher) = watch::channel(0u8);
        let mut seen = Vec::new();
        let outcome = wait_for_bootstrap(
            &mut rx,
            Duration::from_millis(timeout_ms),
            &percent,
            |p| seen.push(p),
        )
        .await;
        let last = *watcher.borrow();
        (outcome, seen, last)
    }

    #[tokio::test]
    async fn test_progress_reported_in_order_once_each() {
        let (outcome, seen, last) = run(
            &[
                "Bootstrapped 0% (starting)",
                "Bootstrapped 37% (loading)",
                "Bootstrapped 37% (loading)",
                "Bootstrapped 20% (stale)",
                "Bootstrapped 100% (done)",
            ],
            false,
            1_000,
        )
        .await;
        assert_eq!(outcome, BootstrapOutcome::Ready);
        assert_eq!(seen, vec![37, 100]);
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_timeout_without_completion() {
        let (outcome, seen, _) = run(&["Bootstrapped 50% (x)"], false, 50).await;
        assert_eq!(outcome, BootstrapOutcome::TimedOut { last_percent: 50 });
        assert_eq!(seen, vec![50]);
    }

    #[tokio::test]
    async fn test_fatal_line_aborts() {
        let (outcome, _, _) = run(
            &["Bootstrapped 5% (conn)", "[err] Could not bind to 127.0.0.1:9050"],
            false,
            1_000,
        )
        .await;
        assert!(matches!(outcome, BootstrapOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_output_closed_early() {
        let (outcome, _, _) = run(&["Bootstrapped 10% (conn)"], true, 1_000).await;
        assert_eq!(outcome, BootstrapOutcome::OutputClosed { last_percent: 10 });
    }
}
