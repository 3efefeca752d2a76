//! The daemon's single-threaded event loop.
//!
//! One task owns the [`Engine`] and multiplexes three sources:
//!
//! 1. The event socket. A valid message is submitted and promoted at once.
//! 2. The wake-up channel. Exited children are reaped, then an expired alarm
//!    or a requested promotion runs the promotion pass.
//! 3. The shutdown future. Resolving it ends the loop immediately; running
//!    workers are left alone.
//!
//! A rejected datagram is logged and dropped. A receive that fails at the
//! socket level is logged once per streak; after [`MAX_RECEIVE_FAILURES`]
//! consecutive failures the loop gives up and returns the error.
//!
//! After each turn, ready records are dispatched if the engine asks for it.
//! Every promotion pass re-arms the alarm to the earliest pending expiry, or
//! disarms it when the pending queue is empty.

use std::future::Future;
use std::io;
use std::time::Instant;

use hotplug_core::{Engine, EngineStats, Event, SubmitOutcome, WorkerLauncher};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::credentials::PeerCredentials;
use crate::transport::{EventSocket, TransportError};
use crate::wake::{Alarm, WakeChannel, Wakeups, watch_children};

/// Consecutive socket receive failures tolerated before the loop exits.
pub const MAX_RECEIVE_FAILURES: u32 = 64;

/// Current time on the runtime clock.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Owns the socket, the engine and the wake-up machinery.
pub struct EventLoop<L: WorkerLauncher> {
    socket: EventSocket,
    engine: Engine<L>,
    wake: WakeChannel,
    alarm: Alarm,
    child_watcher: JoinHandle<()>,
    receive_failures: ReceiveFailures,
}

impl<L: WorkerLauncher> EventLoop<L> {
    /// Wires `socket` to `engine` and starts watching for child exits.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the `SIGCHLD` handler cannot be registered.
    pub fn new(socket: EventSocket, engine: Engine<L>) -> io::Result<Self> {
        let wake = WakeChannel::new();
        let alarm = Alarm::new(wake.handle());
        let child_watcher = watch_children(wake.handle())?;
        Ok(Self {
            socket,
            engine,
            wake,
            alarm,
            child_watcher,
            receive_failures: ReceiveFailures::default(),
        })
    }

    /// Runs until `shutdown` resolves and returns the lifetime counters.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] once the socket has failed
    /// [`MAX_RECEIVE_FAILURES`] receives in a row.
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<EngineStats, TransportError> {
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                () = &mut shutdown => {
                    let snapshot = self.engine.snapshot();
                    info!(
                        pending = snapshot.pending,
                        ready = snapshot.ready,
                        running = snapshot.running,
                        "shutting down, queued events are discarded"
                    );
                    break Ok(());
                }
                received = self.socket.recv_event() => {
                    if let Err(e) = self.on_message(received) {
                        break Err(e);
                    }
                }
                wakeups = self.wake.recv() => self.on_wakeup(wakeups),
            }

            if self.engine.dispatch_pending() {
                self.engine.dispatch_ready();
            }
        };

        self.alarm.disarm();
        self.child_watcher.abort();
        outcome.map(|()| *self.engine.stats())
    }

    fn on_message(
        &mut self,
        received: Result<(Event, PeerCredentials), TransportError>,
    ) -> Result<(), TransportError> {
        let event = match received {
            Ok((event, _creds)) => {
                self.receive_failures.reset();
                event
            },
            Err(TransportError::Io(e)) => {
                if self.receive_failures.record(&e) {
                    return Ok(());
                }
                error!(
                    error = %e,
                    failures = MAX_RECEIVE_FAILURES,
                    "event socket keeps failing, giving up"
                );
                return Err(TransportError::Io(e));
            },
            Err(e) => {
                self.receive_failures.reset();
                warn!(error = %e, "message dropped");
                return Ok(());
            },
        };

        match self.engine.submit(event, now()) {
            SubmitOutcome::Pending(id) | SubmitOutcome::Ready(id) => {
                debug!(%id, "event accepted");
            },
            SubmitOutcome::Duplicate(_) => return Ok(()),
        }

        if self.engine.promote_pending() {
            self.promote();
        }
        Ok(())
    }

    fn on_wakeup(&mut self, wakeups: Wakeups) {
        if wakeups.children {
            let reaped = self.engine.reap();
            debug!(reaped, "collected exited workers");
        }
        if wakeups.alarm || self.engine.promote_pending() {
            self.promote();
        }
    }

    fn promote(&mut self) {
        match self.engine.promote(now()) {
            Some(expiry) => self.alarm.arm(expiry),
            None => self.alarm.disarm(),
        }
    }
}

/// Streak of back-to-back receive failures on the event socket.
#[derive(Debug, Default)]
struct ReceiveFailures {
    consecutive: u32,
}

impl ReceiveFailures {
    /// Counts one failure. Only the first of a streak is logged at `warn`.
    ///
    /// Returns `false` once the streak reaches [`MAX_RECEIVE_FAILURES`].
    fn record(&mut self, error: &io::Error) -> bool {
        self.consecutive += 1;
        if self.consecutive == 1 {
            warn!(%error, "receive on event socket failed");
        } else {
            debug!(%error, consecutive = self.consecutive, "receive failed again");
        }
        self.consecutive < MAX_RECEIVE_FAILURES
    }

    /// Ends the streak after a successful receive.
    fn reset(&mut self) {
        if self.consecutive > 0 {
            info!(failures = self.consecutive, "event socket receiving again");
            self.consecutive = 0;
        }
    }
}
