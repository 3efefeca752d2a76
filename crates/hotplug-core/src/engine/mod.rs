//! The queue engine.
//!
//! [`Engine`] owns every event record and moves it through three stages:
//!
//! ```text
//!  submit ──► pending ──(in order | expired)──► ready ──(key free)──► running
//!     │                                           ▲                     │
//!     └──────────────(unsequenced)────────────────┘        reap ◄───────┘
//! ```
//!
//! Records live in an arena keyed by [`EventId`]; the pending queue, the
//! ready queue and the lock table only hold identifiers, so moving a record
//! between stages never moves the record itself.
//!
//! The engine is synchronous and never blocks. Whoever drives it (the
//! daemon's event loop, or a test) supplies the current time and decides
//! when to call [`Engine::promote`], [`Engine::dispatch_ready`] and
//! [`Engine::reap`].
//!
//! # Invariants
//!
//! - A record is in exactly one of pending, ready or running.
//! - At most one running record per resource key.
//! - `expected_sequence` never decreases.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::event::{Event, EventId, EventRecord, Stage};
use crate::locks::ResourceLockTable;
use crate::pending::{DuplicateSequence, PendingEntry, PendingQueue, PromotionKind};
use crate::worker::{WorkerExit, WorkerLauncher};


/// What happened to a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued in the pending queue.
    Pending(EventId),
    /// Unsequenced; placed directly in the ready queue.
    Ready(EventId),
    /// Dropped because its sequence is already pending.
    Duplicate(DuplicateSequence),
}

/// Lifetime counters, for logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Events accepted by [`Engine::submit`].
    pub received: u64,
    /// Events dropped as duplicate sequences.
    pub duplicates: u64,
    /// Promotions forced by the event timeout.
    pub forced_promotions: u64,
    /// Workers started.
    pub dispatched: u64,
    /// Events discarded because their worker failed to start.
    pub spawn_failures: u64,
    /// Workers reaped.
    pub completed: u64,
}

/// Point-in-time queue sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Records waiting in the pending queue.
    pub pending: usize,
    /// Records waiting for their resource key.
    pub ready: usize,
    /// Records with a live worker.
    pub running: usize,
    /// Next sequence the pending queue waits for.
    pub expected_sequence: u64,
}

/// Ordered, per-resource serialized event dispatcher.
pub struct Engine<L: WorkerLauncher> {
    records: HashMap<EventId, EventRecord<L::Worker>>,
    next_id: u64,
    pending: PendingQueue,
    ready: VecDeque<EventId>,
    locks: ResourceLockTable,
    launcher: L,
    promote_pending: bool,
    dispatch_pending: bool,
    stats: EngineStats,
}

impl<L: WorkerLauncher> Engine<L> {
    /// Creates an engine that forces pending events out after
    /// `event_timeout`.
    pub fn new(launcher: L, event_timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            next_id: 0,
            pending: PendingQueue::new(event_timeout),
            ready: VecDeque::new(),
            locks: ResourceLockTable::new(),
            launcher,
            promote_pending: false,
            dispatch_pending: false,
            stats: EngineStats::default(),
        }
    }

    /// Accepts a validated event.
    ///
    /// Sequenced events go to the pending queue and request a promotion
    /// pass; unsequenced events go straight to the ready queue and request a
    /// dispatch pass.
    pub fn submit(&mut self, event: Event, now: Instant) -> SubmitOutcome {
        let id = EventId::new(self.next_id);
        self.next_id += 1;

        let Some(sequence) = event.sequence else {
            debug!(
                devpath = %event.devpath,
                action = %event.action,
                "unsequenced event, skipping the queue"
            );
            self.records
                .insert(id, EventRecord::new(id, event, Stage::Ready));
            self.ready.push_back(id);
            self.stats.received += 1;
            self.dispatch_pending = true;
            return SubmitOutcome::Ready(id);
        };

        let entry = PendingEntry {
            id,
            sequence,
            enqueued_at: now,
        };
        if let Err(duplicate) = self.pending.insert(entry) {
            warn!(seqnum = sequence, devpath = %event.devpath, "{duplicate}, message ignored");
            self.stats.duplicates += 1;
            return SubmitOutcome::Duplicate(duplicate);
        }

        debug!(
            seqnum = sequence,
            devpath = %event.devpath,
            action = %event.action,
            "queued event"
        );
        self.records
            .insert(id, EventRecord::new(id, event, Stage::Pending));
        self.stats.received += 1;
        self.promote_pending = true;
        SubmitOutcome::Pending(id)
    }

    /// Runs the promotion policy at `now`.
    ///
    /// Returns how long until the head of the pending queue expires, or
    /// `None` if the queue is empty. The caller re-arms its timer with it.
    pub fn promote(&mut self, now: Instant) -> Option<Duration> {
        self.promote_pending = false;
        let pass = self.pending.promote(now);

        for promoted in &pass.promoted {
            let Some(record) = self.records.get_mut(&promoted.id) else {
                panic!("{} is pending but not in the arena", promoted.id);
            };
            debug_assert_eq!(record.stage(), Stage::Pending);
            record.set_stage(Stage::Ready);
            let devpath = &record.event().devpath;
            match promoted.kind {
                PromotionKind::InOrder => {
                    debug!(seqnum = promoted.sequence, %devpath, "moved to ready queue");
                },
                PromotionKind::Expired => {
                    info!(
                        seqnum = promoted.sequence,
                        %devpath,
                        "timeout waiting for predecessor, accepting gap"
                    );
                    self.stats.forced_promotions += 1;
                },
            }
            self.ready.push_back(promoted.id);
        }

        if !pass.promoted.is_empty() {
            self.dispatch_pending = true;
            debug!(
                expected_sequence = self.pending.expected_sequence(),
                "next expected sequence"
            );
        }

        for entry in self.pending.iter() {
            trace!(seqnum = entry.sequence, "sequence in queue");
        }
        if let Some(expiry) = pass.next_expiry {
            debug!(?expiry, "next queued event expires");
        }

        pass.next_expiry
    }

    /// Starts a worker for every ready record whose resource key is free.
    ///
    /// Records whose key is busy stay in the ready queue in their current
    /// order. A record whose worker fails to start is discarded.
    pub fn dispatch_ready(&mut self) {
        self.dispatch_pending = false;
        let candidates = std::mem::take(&mut self.ready);

        for id in candidates {
            let Some(record) = self.records.get_mut(&id) else {
                panic!("{id} is in the ready queue but not in the arena");
            };
            debug_assert_eq!(record.stage(), Stage::Ready);
            let seqnum = record.event().sequence;
            let key = record.event().resource_key();

            if let Some(holder) = self.locks.holder(key) {
                debug!(?seqnum, %holder, devpath = key, "delayed, device busy");
                self.ready.push_back(id);
                continue;
            }

            match self.launcher.launch(record.event()) {
                Ok(worker) => {
                    if let Err(conflict) = self.locks.acquire(key, id) {
                        panic!("lock table out of sync: {conflict}");
                    }
                    let pid = self.launcher.worker_pid(&worker);
                    info!(?seqnum, ?pid, devpath = key, "==> exec");
                    record.attach_worker(worker);
                    self.stats.dispatched += 1;
                },
                Err(e) => {
                    warn!(?seqnum, devpath = key, error = %e, "event dropped");
                    self.records.remove(&id);
                    self.stats.spawn_failures += 1;
                },
            }
        }
    }

    /// Collects every worker that has exited, releasing its resource lock and
    /// discarding its record. Never blocks.
    ///
    /// Returns the number of reaped workers. Any reap requests a dispatch
    /// pass, since a record may be waiting on the freed key.
    pub fn reap(&mut self) -> usize {
        let running: Vec<EventId> = self.locks.holders().collect();
        let mut reaped = 0;

        for id in running {
            let Some(record) = self.records.get_mut(&id) else {
                panic!("{id} holds a resource lock but is not in the arena");
            };
            let Some(worker) = record.worker_mut() else {
                panic!("{id} holds a resource lock without a worker");
            };
            let pid = self.launcher.worker_pid(worker);
            let exit = match self.launcher.try_reap(worker) {
                Ok(None) => continue,
                Ok(Some(exit)) => exit,
                Err(e) => {
                    warn!(?pid, error = %e, "treating worker as finished");
                    WorkerExit::Unknown
                },
            };

            let seqnum = record.event().sequence;
            let key = record.event().resource_key();
            self.locks.release(key, id);
            if exit.success() {
                info!(?seqnum, ?pid, devpath = key, "<== exec came back");
            } else {
                warn!(?seqnum, ?pid, devpath = key, %exit, "<== exec came back");
            }
            self.records.remove(&id);
            self.stats.completed += 1;
            reaped += 1;
        }

        if reaped > 0 {
            self.dispatch_pending = true;
        }
        reaped
    }

    /// Returns `true` if an event was queued since the last promotion pass.
    #[must_use]
    pub const fn promote_pending(&self) -> bool {
        self.promote_pending
    }

    /// Returns `true` if records may be dispatchable.
    #[must_use]
    pub const fn dispatch_pending(&self) -> bool {
        self.dispatch_pending
    }

    /// Next sequence the pending queue waits for.
    #[must_use]
    pub const fn expected_sequence(&self) -> u64 {
        self.pending.expected_sequence()
    }

    /// Current queue sizes.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending.len(),
            ready: self.ready.len(),
            running: self.locks.len(),
            expected_sequence: self.pending.expected_sequence(),
        }
    }

    /// Lifetime counters.
    #[must_use]
    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Returns `true` if no record is pending, ready or running.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.records.is_empty()
    }

    /// Records that currently have a live worker.
    pub fn running(&self) -> impl Iterator<Item = &EventRecord<L::Worker>> {
        self.locks
            .holders()
            .filter_map(|id| self.records.get(&id))
    }

    /// Shared access to the launcher.
    #[must_use]
    pub const fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Exclusive access to the launcher.
    pub const fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }
}
