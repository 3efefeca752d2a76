//! hotplug-daemon - hotplug event serializer daemon library
//!
//! Connects the [`hotplug_core::Engine`] to the operating system: a
//! credentialed datagram socket for inbound events, a process launcher for
//! workers, and a wake-up channel fed by the pending-queue alarm and
//! `SIGCHLD`.
//!
//! # Runtime Requirements
//!
//! The event loop is designed for a **current-thread** Tokio runtime; all
//! queue state lives on one task. The `hotplugd` binary builds that runtime
//! after daemonizing.
//!
//! # Modules
//!
//! - [`credentials`]: Sender credentials attached by the kernel
//! - [`event_loop`]: Socket, wake-up and shutdown multiplexing
//! - [`launcher`]: Worker process launcher
//! - [`transport`]: Event socket binding and message validation
//! - [`wake`]: Wake-up channel, alarm and child-exit watcher

pub mod credentials;
pub mod event_loop;
pub mod launcher;
pub mod transport;
pub mod wake;

pub use credentials::PeerCredentials;
pub use event_loop::{EventLoop, MAX_RECEIVE_FAILURES};
pub use launcher::{ProcessLauncher, WorkerProcess};
pub use transport::{EventSocket, TransportError};
