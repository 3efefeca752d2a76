//! `hotplug send`: encode one event and hand it to the daemon.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use hotplug_core::{Event, message};
use tracing::{debug, info};

/// Send attempts before giving up. The daemon may still be starting.
const SEND_ATTEMPTS: u32 = 20;

/// Pause between send attempts.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Arguments for `hotplug send`.
#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Action, e.g. `add` or `remove`
    #[arg(long)]
    pub action: String,

    /// Device path; events for the same devpath never run concurrently
    #[arg(long)]
    pub devpath: String,

    /// Kernel subsystem, e.g. `block`
    #[arg(long)]
    pub subsystem: String,

    /// Kernel sequence number; omit for an unordered event
    #[arg(long)]
    pub seqnum: Option<u64>,
}

impl SendArgs {
    fn to_event(&self) -> Event {
        let event = Event::new(&self.action, &self.devpath, &self.subsystem);
        match self.seqnum {
            Some(seqnum) => event.with_sequence(seqnum),
            None => event,
        }
    }
}

/// Encode the event and send it to `socket_path`.
pub fn run(socket_path: &Path, args: &SendArgs) -> Result<()> {
    let event = args.to_event();
    let bytes = message::encode(&event).context("invalid event")?;
    let socket = UnixDatagram::unbound().context("failed to create socket")?;

    send_with_retry(&socket, &bytes, socket_path, SEND_ATTEMPTS, RETRY_DELAY).with_context(
        || format!("failed to send event to {}", socket_path.display()),
    )?;

    info!(
        seqnum = ?event.sequence,
        devpath = %event.devpath,
        socket = %socket_path.display(),
        "event sent"
    );
    Ok(())
}

/// Send one datagram, retrying while the daemon socket is not there yet.
fn send_with_retry(
    socket: &UnixDatagram,
    bytes: &[u8],
    target: &Path,
    attempts: u32,
    delay: Duration,
) -> io::Result<()> {
    let mut attempt = 1;
    loop {
        match send_to(socket, bytes, target) {
            Ok(_) => return Ok(()),
            Err(e) if attempt < attempts && is_not_listening(&e) => {
                debug!(attempt, error = %e, "daemon not listening, retrying");
                attempt += 1;
                thread::sleep(delay);
            },
            Err(e) => return Err(e),
        }
    }
}

fn send_to(socket: &UnixDatagram, bytes: &[u8], target: &Path) -> io::Result<usize> {
    match target.as_os_str().as_bytes().strip_prefix(b"@") {
        Some(name) => {
            use std::os::linux::net::SocketAddrExt;
            use std::os::unix::net::SocketAddr;

            let addr = SocketAddr::from_abstract_name(name)?;
            socket.send_to_addr(bytes, &addr)
        },
        None => socket.send_to(bytes, target),
    }
}

fn is_not_listening(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
