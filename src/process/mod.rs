//! Child-process supervision primitives.
//!
//! The anonymity daemon and the TUN bridge both run as OS processes rather
//! than linked libraries. Everything above this module talks to them through
//! [`ProcessLauncher`] and [`SupervisedProcess`], so output parsing and
//! lifecycle logic can be exercised against scripted fakes instead of real
//! binaries.

mod launcher;
mod locate;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use launcher::TokioLauncher;
pub use locate::{ExecutableLocator, InstallLayout};

/// Everything needed to spawn a supervised child.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory (co-located helper binaries are resolved from here).
    pub current_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Descriptors the child must inherit as-is (unix only).
    pub inherited_fds: Vec<i32>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn inherit_fd(mut self, fd: i32) -> Self {
        self.inherited_fds.push(fd);
        self
    }
}

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub Option<i32>);

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running child process.
#[async_trait]
pub trait SupervisedProcess: Send {
    /// OS process id, if known.
    fn id(&self) -> Option<u32>;

    /// Merged stdout/stderr, one line per message. Can only be taken once.
    fn take_output(&mut self) -> Option<mpsc::Receiver<String>>;

    /// Non-blocking liveness check. `Some` once the process has exited.
    fn try_exit(&mut self) -> Option<ExitCode>;

    /// Ask the process to exit, then force-kill it if it is still alive
    /// after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

/// Spawns [`SupervisedProcess`]es.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> std::io::Result<Box<dyn SupervisedProcess>>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted launcher used by daemon and bridge tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Shared view of what happened to a fake process.
    #[derive(Debug, Default)]
    pub struct FakeProbe {
        pub launches: AtomicUsize,
        pub terminated: AtomicUsize,
        pub alive: AtomicBool,
        pub last_spec: Mutex<Option<LaunchSpec>>,
    }

    impl FakeProbe {
        pub fn terminate_count(&self) -> usize {
            self.terminated.load(Ordering::SeqCst)
        }

        pub fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    /// Replays `lines` on the output channel; keeps the channel open afterwards
    /// unless `close_after` is set.
    pub struct FakeLauncher {
        pub lines: Vec<String>,
        pub close_after: bool,
        pub exit_immediately: Option<i32>,
        pub fail_spawn: bool,
        pub probe: Arc<FakeProbe>,
    }

    impl FakeLauncher {
        pub fn with_lines(lines: &[&str]) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                close_after: false,
                exit_immediately: None,
                fail_spawn: false,
                probe: Arc::new(FakeProbe::default()),
            }
        }
    }

    struct FakeProcess {
        output: Option<mpsc::Receiver<String>>,
        // Held so the output channel stays open until terminate.
        _keepalive: Option<mpsc::Sender<String>>,
        exit: Option<ExitCode>,
        probe: Arc<FakeProbe>,
    }

    #[async_trait]
    impl SupervisedProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
            self.output.take()
        }

        fn try_exit(&mut self) -> Option<ExitCode> {
            self.exit
        }

        async fn terminate(&mut self, _grace: Duration) {
            self.probe.terminated.fetch_add(1, Ordering::SeqCst);
            self.probe.alive.store(false, Ordering::SeqCst);
            self._keepalive = None;
            self.exit.get_or_insert(ExitCode(None));
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, spec: LaunchSpec) -> std::io::Result<Box<dyn SupervisedProcess>> {
            if self.fail_spawn {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "spawn refused",
                ));
            }
            self.probe.launches.fetch_add(1, Ordering::SeqCst);
            *self.probe.last_spec.lock().unwrap() = Some(spec);

            let (tx, rx) = mpsc::channel(64);
            for line in &self.lines {
                tx.send(line.clone()).await.unwrap();
            }
            let keepalive = if self.close_after { None } else { Some(tx) };
            let exit = self.exit_immediately.map(|c| ExitCode(Some(c)));
            self.probe.alive.store(exit.is_none(), Ordering::SeqCst);

            Ok(Box::new(FakeProcess {
                output: Some(rx),
                _keepalive: keepalive,
                exit,
                probe: self.probe.clone(),
            }))
        }
    }
}
