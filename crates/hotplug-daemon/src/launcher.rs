//! OS process worker launcher.
//!
//! Each dispatched event runs `<program> <subsystem>` with the event in the
//! environment. Workers are never killed by the daemon; they outlive it if it
//! terminates first.

use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use hotplug_core::{Event, WorkerError, WorkerExit, WorkerLauncher};
use tokio::process::{Child, Command};

/// A running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    pid: u32,
}

impl WorkerProcess {
    /// The OS process ID.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }
}

/// Launches one worker process per event.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    /// Creates a launcher that runs `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The worker program.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Worker = WorkerProcess;

    fn launch(&mut self, event: &Event) -> Result<WorkerProcess, WorkerError> {
        let mut cmd = Command::new(&self.program);

        cmd.arg(&event.subsystem)
            .env("ACTION", &event.action)
            .env("DEVPATH", &event.devpath)
            .env("SUBSYSTEM", &event.subsystem)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        if let Some(sequence) = event.sequence {
            cmd.env("SEQNUM", sequence.to_string());
        }

        let child = cmd
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed(format!("{}: {e}", self.program.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| WorkerError::SpawnFailed("failed to get process ID".to_string()))?;

        Ok(WorkerProcess { child, pid })
    }

    fn try_reap(&mut self, worker: &mut WorkerProcess) -> Result<Option<WorkerExit>, WorkerError> {
        let status = worker
            .child
            .try_wait()
            .map_err(|e| WorkerError::WaitFailed(format!("pid {}: {e}", worker.pid)))?;

        Ok(status.map(|status| {
            status.code().map_or_else(
                || status.signal().map_or(WorkerExit::Unknown, WorkerExit::Signaled),
                WorkerExit::Exited,
            )
        }))
    }

    fn worker_pid(&self, worker: &WorkerProcess) -> Option<u32> {
        Some(worker.pid)
    }
}
