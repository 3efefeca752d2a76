//! hotplug-core - event serialization engine
//!
//! This crate holds everything about the hotplug event serializer that does
//! not touch the operating system: the wire message codec, the pending queue
//! that restores kernel sequence order, the resource lock table that keeps
//! at most one worker per device, and the [`Engine`] tying them together.
//!
//! The daemon crate supplies sockets, processes and timers and drives the
//! engine from its event loop.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration for the daemon
//! - [`engine`]: Pending, ready and running stages plus dispatch
//! - [`event`]: Event payload and per-event records
//! - [`locks`]: Resource key lock table
//! - [`message`]: Fixed-layout datagram codec
//! - [`pending`]: Sequence-ordered pending queue with timeout promotion
//! - [`worker`]: Worker launching contract

pub mod config;
pub mod engine;
pub mod event;
pub mod locks;
pub mod message;
pub mod pending;
pub mod worker;

pub use config::{ConfigError, HotplugConfig};
pub use engine::{Engine, EngineStats, QueueSnapshot, SubmitOutcome};
pub use event::{Event, EventId, EventRecord, Stage};
pub use message::MessageError;
pub use worker::{WorkerError, WorkerExit, WorkerLauncher};
