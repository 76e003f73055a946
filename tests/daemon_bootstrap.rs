//! Daemon supervision through a scripted launcher.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use veilnet::daemon::{DaemonError, DaemonProcess, DaemonSettings, DaemonState};
use veilnet::process::{
    ExecutableLocator, ExitCode, InstallLayout, LaunchSpec, ProcessLauncher, SupervisedProcess,
};

#[derive(Default)]
struct Record {
    kills: AtomicUsize,
}

struct Scripted {
    lines: Vec<&'static str>,
    record: Arc<Record>,
}

struct ScriptedChild {
    output: Option<mpsc::Receiver<String>>,
    hold: Option<mpsc::Sender<String>>,
    exited: bool,
    record: Arc<Record>,
}

#[async_trait]
impl SupervisedProcess for ScriptedChild {
    fn id(&self) -> Option<u32> {
        Some(1)
    }

    fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    fn try_exit(&mut self) -> Option<ExitCode> {
        self.exited.then_some(ExitCode(None))
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.record.kills.fetch_add(1, Ordering::SeqCst);
        self.hold = None;
        self.exited = true;
    }
}

#[async_trait]
impl ProcessLauncher for Scripted {
    async fn launch(&self, _spec: LaunchSpec) -> std::io::Result<Box<dyn SupervisedProcess>> {
        let (tx, rx) = mpsc::channel(16);
        for line in &self.lines {
            tx.send(line.to_string()).await.ok();
        }
        Ok(Box::new(ScriptedChild {
            output: Some(rx),
            hold: Some(tx),
            exited: false,
            record: self.record.clone(),
        }))
    }
}

fn daemon(dir: &Path, lines: Vec<&'static str>) -> (DaemonProcess, Arc<Record>) {
    let bin = dir.join("lib/x86_64/libtor.so");
    fs::create_dir_all(bin.parent().unwrap()).unwrap();
    fs::write(&bin, b"").unwrap();
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();

    let locator = ExecutableLocator::new(InstallLayout {
        native_lib_dir: Some(dir.join("lib")),
        abi: "x86_64".into(),
        sibling_abis: vec![],
        data_dir: dir.join("data"),
        assets_dir: None,
    });
    let mut settings = DaemonSettings::new(dir.join("data/daemon"));
    settings.bootstrap_timeout = Duration::from_millis(150);
    settings.control_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let record = Arc::new(Record::default());
    let launcher = Scripted {
        lines,
        record: record.clone(),
    };
    (
        DaemonProcess::new(Arc::new(launcher), locator, settings),
        record,
    )
}

#[tokio::test]
async fn progress_is_reported_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (mut daemon, record) = daemon(
        dir.path(),
        vec![
            "Mar 01 [notice] Bootstrapped 37% (loading_descriptors)",
            "Mar 01 [notice] Bootstrapped 100% (done): Done",
        ],
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    daemon
        .start(false, move |p| sink.lock().unwrap().push(p))
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![37, 100]);
    assert_eq!(daemon.state(), DaemonState::Ready);
    assert_eq!(daemon.handle().bootstrap_percent, 100);
    assert!(dir.path().join("data/daemon/torrc").exists());

    daemon.stop().await;
    daemon.stop().await;
    assert_eq!(daemon.state(), DaemonState::Idle);
    assert_eq!(record.kills.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stalled_bootstrap_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let (mut daemon, record) = daemon(dir.path(), vec!["Bootstrapped 5% (conn)"]);

    let err = daemon.start(false, |_| {}).await.unwrap_err();
    assert!(matches!(
        err,
        DaemonError::BootstrapTimeout {
            last_percent: 5,
            ..
        }
    ));
    assert_eq!(daemon.state(), DaemonState::Errored);
    assert_eq!(record.kills.load(Ordering::SeqCst), 1);
}
