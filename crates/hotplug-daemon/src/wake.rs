//! Wake-up channel between asynchronous producers and the event loop.
//!
//! The alarm task and the child-exit watcher never touch queue state. They
//! set a reason flag and post a notification on a channel of capacity one;
//! a full channel means a wake-up is already pending, so repeated raises
//! coalesce. The event loop drains the channel and acts on every raised
//! reason.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Why the event loop was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The pending-queue timer expired.
    Alarm,
    /// At least one worker process exited.
    ChildExited,
}

/// Reasons collected by one drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Wakeups {
    /// The alarm fired.
    pub alarm: bool,
    /// A child exited.
    pub children: bool,
}

impl Wakeups {
    /// Returns `true` if nothing was raised.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        !self.alarm && !self.children
    }
}

#[derive(Debug, Default)]
struct Flags {
    alarm: AtomicBool,
    children: AtomicBool,
}

impl Flags {
    fn get(&self, reason: WakeReason) -> &AtomicBool {
        match reason {
            WakeReason::Alarm => &self.alarm,
            WakeReason::ChildExited => &self.children,
        }
    }
}

/// Producer side of the wake-up channel.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    tx: mpsc::Sender<()>,
    flags: Arc<Flags>,
}

impl WakeHandle {
    /// Record `reason` and wake the loop if no wake-up is pending yet.
    pub fn raise(&self, reason: WakeReason) {
        self.flags.get(reason).store(true, Ordering::Release);
        if self.tx.try_send(()).is_err() {
            trace!(?reason, "wake-up already pending");
        }
    }
}

/// Consumer side of the wake-up channel, owned by the event loop.
#[derive(Debug)]
pub struct WakeChannel {
    rx: mpsc::Receiver<()>,
    handle: WakeHandle,
}

impl WakeChannel {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            rx,
            handle: WakeHandle {
                tx,
                flags: Arc::new(Flags::default()),
            },
        }
    }

    /// A producer handle.
    #[must_use]
    pub fn handle(&self) -> WakeHandle {
        self.handle.clone()
    }

    /// Waits for a wake-up, then drains.
    ///
    /// Cancel safe: a notification is only consumed together with its
    /// reasons.
    pub async fn recv(&mut self) -> Wakeups {
        // The channel holds its own sender, so `recv` never sees it closed.
        let _ = self.rx.recv().await;
        self.drain()
    }

    /// Empties the channel and returns the raised reasons, clearing them.
    pub fn drain(&mut self) -> Wakeups {
        while self.rx.try_recv().is_ok() {}
        Wakeups {
            alarm: self.handle.flags.alarm.swap(false, Ordering::AcqRel),
            children: self.handle.flags.children.swap(false, Ordering::AcqRel),
        }
    }
}

impl Default for WakeChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-shot timer raising [`WakeReason::Alarm`].
///
/// At most one deadline is armed; arming again replaces it.
#[derive(Debug)]
pub struct Alarm {
    handle: WakeHandle,
    task: Option<JoinHandle<()>>,
}

impl Alarm {
    /// Creates a disarmed alarm.
    #[must_use]
    pub const fn new(handle: WakeHandle) -> Self {
        Self { handle, task: None }
    }

    /// Fire after `delay`, replacing any previous deadline.
    pub fn arm(&mut self, delay: Duration) {
        self.disarm();
        let handle = self.handle.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.raise(WakeReason::Alarm);
        }));
    }

    /// Cancel the pending deadline, if any.
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Returns `true` if a deadline is armed and has not fired yet.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Spawns a task raising [`WakeReason::ChildExited`] on every `SIGCHLD`.
///
/// # Errors
///
/// Returns an error if the signal handler cannot be registered.
pub fn watch_children(handle: WakeHandle) -> io::Result<JoinHandle<()>> {
    let mut sigchld = signal(SignalKind::child())?;
    Ok(tokio::spawn(async move {
        while sigchld.recv().await.is_some() {
            handle.raise(WakeReason::ChildExited);
        }
    }))
}
