//! Worker launching contract.
//!
//! The engine does not know how workers run; it only starts one per
//! dispatched event and later polls whether it has exited. The daemon plugs
//! in an OS process launcher, tests plug in a scripted one.

use std::fmt;

use thiserror::Error;

use crate::event::Event;

/// Errors starting or collecting a worker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker could not be started.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The worker's exit status could not be collected.
    #[error("failed to collect worker status: {0}")]
    WaitFailed(String),
}

/// How a worker finished. Logged only, never interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
    /// Exited, but the status could not be decoded.
    Unknown,
}

impl WorkerExit {
    /// Returns `true` for a zero exit code.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Starts workers and collects their completion without blocking.
pub trait WorkerLauncher {
    /// Handle kept in the event record while the worker runs.
    type Worker;

    /// Starts a worker for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::SpawnFailed`] if nothing was started.
    fn launch(&mut self, event: &Event) -> Result<Self::Worker, WorkerError>;

    /// Checks whether `worker` has exited. Must not block.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::WaitFailed`] if the status cannot be collected;
    /// the engine then treats the worker as finished.
    fn try_reap(&mut self, worker: &mut Self::Worker) -> Result<Option<WorkerExit>, WorkerError>;

    /// OS process id of `worker`, for logging.
    fn worker_pid(&self, _worker: &Self::Worker) -> Option<u32> {
        None
    }
}
