//! End-to-end: event socket, event loop and real worker processes.
//!
//! Each test binds an [`EventSocket`] in a temporary directory, runs the
//! [`EventLoop`] with a [`ProcessLauncher`] pointed at a shell script, and
//! sends encoded messages the way the `hotplug` sender does. The script
//! appends `start`/`end` lines to a log so worker lifetimes can be checked.
//!
//! This test validates that:
//! 1. Workers for the same device never overlap
//! 2. A finished worker releases the next event for its device without any
//!    further message
//! 3. A missing sequence number is skipped after the event timeout
//! 4. A worker program that cannot start does not wedge the loop

use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hotplug_core::{Engine, EngineStats, Event, message};
use hotplug_daemon::{EventLoop, EventSocket, ProcessLauncher, TransportError};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Daemon {
    dir: TempDir,
    socket: PathBuf,
    log: PathBuf,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<EngineStats, TransportError>>,
}

impl Daemon {
    /// Starts the loop with a worker that logs its lifetime and sleeps for
    /// `work` in between.
    fn start(event_timeout: Duration, work: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("workers.log");
        let script = dir.path().join("worker");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 echo \"start $SEQNUM $DEVPATH\" >> {log}\n\
                 sleep {work}\n\
                 echo \"end $SEQNUM $DEVPATH\" >> {log}\n",
                log = log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self::start_with_program(dir, script, log, event_timeout)
    }

    fn start_with_program(dir: TempDir, program: PathBuf, log: PathBuf, event_timeout: Duration) -> Self {
        let socket = dir.path().join("event.sock");
        let event_socket = EventSocket::bind(&socket, nix::unistd::getuid().as_raw()).unwrap();
        let engine = Engine::new(ProcessLauncher::new(program), event_timeout);
        let event_loop = EventLoop::new(event_socket, engine).unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(event_loop.run(async {
            let _ = stopped.await;
        }));

        Self {
            dir,
            socket,
            log,
            stop,
            task,
        }
    }

    fn send(&self, seq: Option<u64>, devpath: &str) {
        let mut event = Event::new("add", devpath, "block");
        event.sequence = seq;
        UnixDatagram::unbound()
            .unwrap()
            .send_to(&message::encode(&event).unwrap(), &self.socket)
            .unwrap();
    }

    async fn shutdown(self) -> EngineStats {
        self.stop.send(()).unwrap();
        let stats = self.task.await.unwrap().unwrap();
        drop(self.dir);
        stats
    }
}

fn read_log(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .map(|s| s.lines().map(str::to_owned).collect())
        .unwrap_or_default()
}

async fn wait_for_lines(log: &Path, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let lines = read_log(log);
        if lines.len() >= count {
            return lines;
        }
        assert!(
            Instant::now() < deadline,
            "expected {count} log lines, got {lines:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn same_device_workers_never_overlap() {
    let daemon = Daemon::start(Duration::from_secs(30), "0.2");

    daemon.send(Some(0), "/devices/sda");
    daemon.send(Some(1), "/devices/sda");
    daemon.send(Some(2), "/devices/sda");

    let lines = wait_for_lines(&daemon.log, 6).await;
    assert_eq!(
        lines,
        vec![
            "start 0 /devices/sda",
            "end 0 /devices/sda",
            "start 1 /devices/sda",
            "end 1 /devices/sda",
            "start 2 /devices/sda",
            "end 2 /devices/sda",
        ]
    );

    // Let the last worker be reaped before stopping.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = daemon.shutdown().await;
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.completed, 3);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn other_devices_run_concurrently() {
    let daemon = Daemon::start(Duration::from_secs(30), "0.5");

    daemon.send(Some(0), "/devices/sda");
    daemon.send(Some(1), "/devices/sdb");

    let lines = wait_for_lines(&daemon.log, 4).await;
    // Both start before either ends.
    assert!(lines[0].starts_with("start"), "{lines:?}");
    assert!(lines[1].starts_with("start"), "{lines:?}");

    daemon.shutdown().await;
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn gap_skipped_after_event_timeout() {
    let daemon = Daemon::start(Duration::from_secs(1), "0");
    let sent = Instant::now();

    daemon.send(Some(5), "/devices/sda");

    let lines = wait_for_lines(&daemon.log, 1).await;
    assert!(sent.elapsed() >= Duration::from_secs(1));
    assert_eq!(lines[0], "start 5 /devices/sda");

    // The cursor moved past the gap: 6 now runs without waiting.
    let sent = Instant::now();
    daemon.send(Some(6), "/devices/sdb");
    let lines = wait_for_lines(&daemon.log, 4).await;
    assert!(lines.iter().any(|l| l == "start 6 /devices/sdb"));
    assert!(sent.elapsed() < Duration::from_secs(1));

    let stats = daemon.shutdown().await;
    assert_eq!(stats.forced_promotions, 1);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn unsequenced_event_runs_immediately() {
    let daemon = Daemon::start(Duration::from_secs(30), "0");

    daemon.send(Some(9), "/devices/sda");
    daemon.send(None, "/devices/sdb");

    let lines = wait_for_lines(&daemon.log, 2).await;
    assert_eq!(lines, vec!["start  /devices/sdb", "end  /devices/sdb"]);

    let stats = daemon.shutdown().await;
    assert_eq!(stats.dispatched, 1);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn unspawnable_worker_does_not_wedge_loop() {
    let dir = TempDir::new().unwrap();
    let program = dir.path().join("missing-worker");
    let log = dir.path().join("unused.log");
    let daemon = Daemon::start_with_program(dir, program, log, Duration::from_secs(30));

    daemon.send(Some(0), "/devices/sda");
    daemon.send(Some(1), "/devices/sda");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = daemon.shutdown().await;
    assert_eq!(stats.received, 2);
    assert_eq!(stats.spawn_failures, 2);
    assert_eq!(stats.dispatched, 0);
}
