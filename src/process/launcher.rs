//! Real child processes via `tokio::process`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ExitCode, LaunchSpec, ProcessLauncher, SupervisedProcess};

/// Output lines buffered between the pipe readers and the consumer.
const OUTPUT_BUFFER: usize = 256;

/// Launches children with piped, line-merged output.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, spec: LaunchSpec) -> std::io::Result<Box<dyn SupervisedProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.current_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        if !spec.inherited_fds.is_empty() {
            let fds = spec.inherited_fds.clone();
            // SAFETY: the hook runs between fork and exec and only calls
            // fcntl, which is async-signal-safe. It touches the child's
            // descriptor table, never the parent's.
            unsafe {
                command.pre_exec(move || {
                    for fd in &fds {
                        clear_cloexec(*fd)?;
                    }
                    Ok(())
                });
            }
        }

        debug!("Spawning {} {:?}", spec.program.display(), spec.args);
        let mut child = command.spawn()?;

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        Ok(Box::new(TokioProcess {
            child,
            output: Some(rx),
        }))
    }
}

/// Copy lines from a pipe into the merged output channel until EOF or until
/// nobody is listening anymore.
async fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Output pipe read error: {}", e);
                break;
            }
        }
    }
}

/// Let a descriptor survive `exec` so the child inherits it by number.
/// Only called in the forked child.
#[cfg(unix)]
fn clear_cloexec(fd: i32) -> std::io::Result<()> {
    // SAFETY: fcntl on an integer descriptor has no memory-safety
    // preconditions; failures are reported through errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

struct TokioProcess {
    child: Child,
    output: Option<mpsc::Receiver<String>>,
}

impl TokioProcess {
    #[cfg(unix)]
    fn signal_terminate(&self) {
        if let Some(pid) = self.child.id() {
            // SAFETY: plain syscall with a pid we own; ESRCH is harmless.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!("SIGTERM to {} failed: {}", pid, std::io::Error::last_os_error());
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl SupervisedProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    fn try_exit(&mut self) -> Option<ExitCode> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(ExitCode(status.code())),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to poll child status: {}", e);
                None
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if self.try_exit().is_some() {
            return;
        }

        self.signal_terminate();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Child exited after terminate: {}", status);
            }
            Ok(Err(e)) => {
                warn!("Waiting for child failed: {}", e);
            }
            Err(_) => {
                warn!(
                    "Child did not exit within {}ms, killing",
                    grace.as_millis()
                );
                let _ = self.child.kill().await;
            }
        }
    }
}
