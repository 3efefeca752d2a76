//! Pending queue and the promotion policy.
//!
//! Sequenced events wait here until either their sequence number is the one
//! the queue expects next, or they have waited for the event timeout. The
//! timeout bounds how long a lost or late predecessor can stall everything
//! queued behind it.
//!
//! # Invariants
//!
//! - Entries are kept in strictly ascending sequence order.
//! - `expected_sequence` never decreases.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::event::EventId;

/// A pending entry. The record itself lives in the engine arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    /// Arena identifier of the record.
    pub id: EventId,
    /// Upstream sequence number.
    pub sequence: u64,
    /// When the record was queued.
    pub enqueued_at: Instant,
}

/// Why an entry left the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionKind {
    /// Its sequence was the expected one.
    InOrder,
    /// It waited for the full timeout; the gap before it is accepted.
    Expired,
}

/// One entry moved to the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promoted {
    /// Arena identifier of the record.
    pub id: EventId,
    /// Upstream sequence number.
    pub sequence: u64,
    /// Why it was promoted.
    pub kind: PromotionKind,
}

/// Result of one promotion pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PromotionPass {
    /// Entries promoted, in promotion order.
    pub promoted: Vec<Promoted>,
    /// Time until the new head expires, if the queue is non-empty.
    pub next_expiry: Option<Duration>,
}

/// A sequence number that is already pending.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("sequence {sequence} is already queued as {existing}")]
pub struct DuplicateSequence {
    /// The duplicated sequence number.
    pub sequence: u64,
    /// The record already holding it.
    pub existing: EventId,
}

/// Ordered queue of sequenced events awaiting their turn.
#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    expected_sequence: u64,
    timeout: Duration,
}

impl PendingQueue {
    /// Creates an empty queue expecting sequence 0.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            expected_sequence: 0,
            timeout,
        }
    }

    /// Inserts an entry at its sequence position.
    ///
    /// Arrivals are usually close to sorted, so the scan runs backwards from
    /// the tail and stops at the first smaller sequence.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicateSequence`] if the sequence is already queued; the
    /// queue is left unchanged.
    pub fn insert(&mut self, entry: PendingEntry) -> Result<(), DuplicateSequence> {
        let mut position = self.entries.len();
        for (index, queued) in self.entries.iter().enumerate().rev() {
            if queued.sequence < entry.sequence {
                break;
            }
            if queued.sequence == entry.sequence {
                return Err(DuplicateSequence {
                    sequence: entry.sequence,
                    existing: queued.id,
                });
            }
            position = index;
        }
        self.entries.insert(position, entry);
        Ok(())
    }

    /// Runs one promotion pass at `now`.
    ///
    /// Moves the head out while it is the expected sequence or has expired,
    /// then reports when the next head will expire. A head below the cursor
    /// is only released by expiry and leaves the cursor where it is.
    pub fn promote(&mut self, now: Instant) -> PromotionPass {
        let mut pass = PromotionPass::default();

        while let Some(head) = self.entries.front().copied() {
            let age = now.saturating_duration_since(head.enqueued_at);
            let kind = if head.sequence == self.expected_sequence {
                PromotionKind::InOrder
            } else if age >= self.timeout {
                PromotionKind::Expired
            } else {
                pass.next_expiry = Some(self.timeout - age);
                break;
            };

            self.entries.pop_front();
            if head.sequence >= self.expected_sequence {
                self.expected_sequence = head.sequence.saturating_add(1);
            }
            pass.promoted.push(Promoted {
                id: head.id,
                sequence: head.sequence,
                kind,
            });
        }

        pass
    }

    /// Returns the next sequence the queue is waiting for.
    #[must_use]
    pub const fn expected_sequence(&self) -> u64 {
        self.expected_sequence
    }

    /// Returns the number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }
}
