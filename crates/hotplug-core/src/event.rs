//! Event records.
//!
//! An [`Event`] is the immutable content of one device notification as it
//! arrived on the wire. An [`EventRecord`] wraps it with the bookkeeping the
//! engine needs while the event moves through the pending, ready and running
//! stages.

use std::fmt;

/// Stable identifier of an event record inside the engine arena.
///
/// Identifiers are never reused for the lifetime of an engine, so a stale id
/// can only miss, never alias another record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// One device state-change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Upstream ordering key. `None` means the event is unordered and skips
    /// the pending queue.
    pub sequence: Option<u64>,
    /// Action name, e.g. `add` or `remove`.
    pub action: String,
    /// Device path. Serves as the resource key: events sharing a devpath
    /// never run concurrently.
    pub devpath: String,
    /// Kernel subsystem, e.g. `block`.
    pub subsystem: String,
}

impl Event {
    /// Creates an unsequenced event.
    #[must_use]
    pub fn new(
        action: impl Into<String>,
        devpath: impl Into<String>,
        subsystem: impl Into<String>,
    ) -> Self {
        Self {
            sequence: None,
            action: action.into(),
            devpath: devpath.into(),
            subsystem: subsystem.into(),
        }
    }

    /// Sets the upstream sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Returns the resource key that serializes execution.
    #[must_use]
    pub fn resource_key(&self) -> &str {
        &self.devpath
    }
}

/// Which engine queue currently owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting in the pending queue for its sequence slot or timeout.
    Pending,
    /// Promoted, waiting for its resource key to be free.
    Ready,
    /// A worker is executing it and it holds its resource lock.
    Running,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// An event plus its engine bookkeeping.
///
/// `W` is the launcher's worker handle type; it is `None` until the record
/// is dispatched.
#[derive(Debug)]
pub struct EventRecord<W> {
    id: EventId,
    event: Event,
    stage: Stage,
    worker: Option<W>,
}

impl<W> EventRecord<W> {
    pub(crate) const fn new(id: EventId, event: Event, stage: Stage) -> Self {
        Self {
            id,
            event,
            stage,
            worker: None,
        }
    }

    /// Returns the record identifier.
    #[must_use]
    pub const fn id(&self) -> EventId {
        self.id
    }

    /// Returns the event content.
    #[must_use]
    pub const fn event(&self) -> &Event {
        &self.event
    }

    /// Returns the current stage.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns the worker handle once dispatched.
    #[must_use]
    pub const fn worker(&self) -> Option<&W> {
        self.worker.as_ref()
    }

    pub(crate) const fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
    }

    pub(crate) fn attach_worker(&mut self, worker: W) {
        self.stage = Stage::Running;
        self.worker = Some(worker);
    }

    pub(crate) const fn worker_mut(&mut self) -> Option<&mut W> {
        self.worker.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_builder_sets_sequence() {
        let event = Event::new("add", "/devices/sda", "block").with_sequence(7);
        assert_eq!(event.sequence, Some(7));
        assert_eq!(event.resource_key(), "/devices/sda");
    }

    #[test]
    fn record_starts_without_worker() {
        let record: EventRecord<u32> = EventRecord::new(
            EventId::new(1),
            Event::new("add", "/devices/sda", "block"),
            Stage::Pending,
        );
        assert!(record.worker().is_none());
        assert_eq!(record.stage(), Stage::Pending);
        assert_eq!(record.id().to_string(), "event#1");
    }

    #[test]
    fn attaching_worker_marks_running() {
        let mut record: EventRecord<u32> = EventRecord::new(
            EventId::new(2),
            Event::new("remove", "/devices/sdb", "block"),
            Stage::Ready,
        );
        record.attach_worker(4242);
        assert_eq!(record.stage(), Stage::Running);
        assert_eq!(record.worker(), Some(&4242));
    }
}
