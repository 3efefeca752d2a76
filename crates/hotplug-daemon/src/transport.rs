//! Credentialed datagram transport for inbound event messages.
//!
//! The daemon listens on a single `SOCK_DGRAM` Unix socket with
//! `SO_PASSCRED` enabled, so the kernel attaches the sender's credentials to
//! every datagram. Each datagram carries exactly one fixed-size message.
//!
//! # Addressing
//!
//! - A path starting with `@` binds in the Linux abstract namespace; nothing
//!   is created on disk.
//! - Any other path binds a socket file. Its parent directory is created with
//!   mode 0700 if missing, a stale socket file is removed, and the socket is
//!   set to mode 0600 after binding.
//!
//! Either way the bind doubles as the single-instance check: binding fails
//! with [`io::ErrorKind::AddrInUse`] while another process is listening on
//! the same address.
//!
//! # Validation
//!
//! [`EventSocket::recv_event`] rejects datagrams without credentials, from a
//! uid other than the trusted one, or that do not decode. Every rejection is
//! a [`TransportError`]; the caller drops the datagram and keeps going.

use std::io::{self, IoSliceMut};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use hotplug_core::Event;
use hotplug_core::message::{self, MESSAGE_SIZE, MessageError};
use nix::sys::socket::{
    ControlMessageOwned, MsgFlags, UnixCredentials, recvmsg, setsockopt, sockopt,
};
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::UnixDatagram;
use tracing::{debug, info, warn};

use crate::credentials::PeerCredentials;

/// Socket file permissions (owner read/write only).
const SOCKET_MODE: u32 = 0o600;

/// Directory permissions for a directory we create (owner only).
const DIRECTORY_MODE: u32 = 0o700;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket setup or receive failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The datagram carried no `SCM_CREDENTIALS` message.
    #[error("no sender credentials, message ignored")]
    MissingCredentials,

    /// The sender is not the trusted uid.
    #[error("sender uid={uid} ignored")]
    Untrusted {
        /// Sender uid reported by the kernel.
        uid: u32,
    },

    /// The datagram is not a valid event message.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// A datagram as received, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// Datagram payload. Longer than [`MESSAGE_SIZE`] if the datagram was
    /// truncated.
    pub bytes: Vec<u8>,
    /// Sender credentials, if the kernel attached them.
    pub credentials: Option<PeerCredentials>,
}

#[derive(Debug)]
enum Endpoint {
    File(PathBuf),
    Abstract(Vec<u8>),
}

/// The daemon's inbound event socket.
#[derive(Debug)]
pub struct EventSocket {
    socket: UnixDatagram,
    endpoint: Endpoint,
    trusted_uid: u32,
}

impl EventSocket {
    /// Bind the event socket at `path`, accepting messages from
    /// `trusted_uid` only.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The parent directory cannot be created, or is a symlink
    /// - A non-socket file occupies `path`
    /// - Another process is listening on `path`
    /// - The socket cannot be bound
    /// - Permissions or `SO_PASSCRED` cannot be set
    pub fn bind(path: &Path, trusted_uid: u32) -> Result<Self, TransportError> {
        let (socket, endpoint) = match path.as_os_str().as_bytes().strip_prefix(b"@") {
            Some(name) => (Self::bind_abstract(name)?, Endpoint::Abstract(name.to_vec())),
            None => (Self::bind_file(path)?, Endpoint::File(path.to_path_buf())),
        };

        setsockopt(&socket, sockopt::PassCred, &true).map_err(|e| {
            io::Error::new(
                io::Error::from(e).kind(),
                format!("failed to enable SO_PASSCRED: {e}"),
            )
        })?;

        info!(socket = %path.display(), trusted_uid, "event socket bound");

        Ok(Self {
            socket,
            endpoint,
            trusted_uid,
        })
    }

    fn bind_abstract(name: &[u8]) -> io::Result<UnixDatagram> {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::{SocketAddr, UnixDatagram as StdUnixDatagram};

        let addr = SocketAddr::from_abstract_name(name)?;
        let socket = StdUnixDatagram::bind_addr(&addr).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!(
                    "failed to bind abstract socket @{}: {e}",
                    String::from_utf8_lossy(name)
                ),
            )
        })?;
        socket.set_nonblocking(true)?;
        UnixDatagram::from_std(socket)
    }

    fn bind_file(path: &Path) -> io::Result<UnixDatagram> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_directory(parent)?;
        }
        cleanup_socket(path)?;

        let socket = UnixDatagram::bind(path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to bind event socket to {}: {e}", path.display()),
            )
        })?;

        set_socket_permissions(path, SOCKET_MODE)?;
        Ok(socket)
    }

    /// Wait for the next datagram and return it unvalidated.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the receive fails.
    pub async fn recv(&self) -> Result<Received, TransportError> {
        // One byte of headroom so an oversized datagram is seen as such.
        let mut buf = vec![0u8; MESSAGE_SIZE + 1];
        let fd = self.socket.as_raw_fd();

        let (len, credentials) = self
            .socket
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg = nix::cmsg_space!(UnixCredentials);
                let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), MsgFlags::MSG_DONTWAIT)
                    .map_err(io::Error::from)?;

                let mut credentials = None;
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmCredentials(cred) = cmsg {
                        credentials = Some(PeerCredentials::from(cred));
                    }
                }
                Ok((msg.bytes, credentials))
            })
            .await?;

        buf.truncate(len);
        Ok(Received {
            bytes: buf,
            credentials,
        })
    }

    /// Wait for the next datagram and validate it into an [`Event`].
    ///
    /// # Errors
    ///
    /// Returns an error if the receive fails, the sender is missing or
    /// untrusted, or the payload does not decode. Only the first is a socket
    /// problem; the others reject one datagram.
    pub async fn recv_event(&self) -> Result<(Event, PeerCredentials), TransportError> {
        let received = self.recv().await?;
        self.validate(&received)
    }

    fn validate(&self, received: &Received) -> Result<(Event, PeerCredentials), TransportError> {
        let creds = received
            .credentials
            .ok_or(TransportError::MissingCredentials)?;
        if !creds.is_uid(self.trusted_uid) {
            return Err(TransportError::Untrusted { uid: creds.uid });
        }
        let event = message::decode(&received.bytes)?;
        debug!(
            uid = creds.uid,
            pid = ?creds.pid,
            seqnum = ?event.sequence,
            devpath = %event.devpath,
            "received message"
        );
        Ok((event, creds))
    }

    /// Filesystem path of the socket, or `None` in the abstract namespace.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.endpoint {
            Endpoint::File(path) => Some(path),
            Endpoint::Abstract(_) => None,
        }
    }

    /// Remove the socket file. A no-op in the abstract namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket file exists but cannot be removed.
    pub fn cleanup(&self) -> Result<(), TransportError> {
        let Endpoint::File(path) = &self.endpoint else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!(socket_path = %path.display(), "Removed event socket file");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io::Error::new(
                e.kind(),
                format!("failed to remove event socket {}: {e}", path.display()),
            )
            .into()),
        }
    }
}

impl Drop for EventSocket {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Failed to cleanup event socket on drop: {e}");
        }
    }
}

/// Ensure a directory exists, creating it with mode 0700.
///
/// Existing directories keep their permissions. Symlinks are refused.
fn ensure_directory(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) => {
            if metadata.file_type().is_symlink() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} is a symlink, refusing to use as socket directory",
                        path.display()
                    ),
                ));
            }
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists but is not a directory", path.display()),
                ));
            }
            Ok(())
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            use std::os::unix::fs::PermissionsExt;

            std::fs::create_dir_all(path).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("failed to create directory {}: {e}", path.display()),
                )
            })?;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIRECTORY_MODE))
                .map_err(|e| {
                    io::Error::new(
                        e.kind(),
                        format!("failed to set permissions on {}: {e}", path.display()),
                    )
                })
        },
        Err(e) => Err(io::Error::new(
            e.kind(),
            format!("failed to stat {}: {e}", path.display()),
        )),
    }
}

fn set_socket_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!(
                "failed to set socket permissions on {}: {e}",
                path.display()
            ),
        )
    })
}

/// Remove a stale socket file. Anything other than a socket, or a socket
/// that still has a listener, is left alone and reported.
fn cleanup_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::UnixDatagram as StdUnixDatagram;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(io::Error::new(
                e.kind(),
                format!("failed to stat {}: {e}", path.display()),
            ));
        },
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("path {} exists but is not a socket", path.display()),
        ));
    }

    // Only a socket nobody is bound to refuses the connection.
    match StdUnixDatagram::unbound().and_then(|client| client.connect(path)) {
        Ok(()) => {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!(
                    "socket {} is in use, is another hotplugd running?",
                    path.display()
                ),
            ));
        },
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {},
        Err(e) => {
            return Err(io::Error::new(
                e.kind(),
                format!("failed to check socket {}: {e}", path.display()),
            ));
        },
    }

    std::fs::remove_file(path).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("failed to remove stale socket {}: {e}", path.display()),
        )
    })?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixDatagram as StdUnixDatagram;

    use tempfile::TempDir;

    use super::*;

    fn my_uid() -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn sample_event() -> Event {
        Event::new("add", "/devices/pci0000:00/block/sda", "block").with_sequence(7)
    }

    #[tokio::test]
    async fn test_bind_sets_socket_permissions_0600() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");

        let socket = EventSocket::bind(&path, my_uid()).unwrap();
        assert_eq!(socket.path(), Some(path.as_path()));

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, SOCKET_MODE);
    }

    #[tokio::test]
    async fn test_bind_creates_parent_directory_0700() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("run").join("hotplugd");
        let path = dir.join("event.sock");

        let _socket = EventSocket::bind(&path, my_uid()).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, DIRECTORY_MODE);
    }

    #[tokio::test]
    async fn test_existing_directory_permissions_preserved() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("shared");
        std::fs::create_dir(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        let _socket = EventSocket::bind(&dir.join("event.sock"), my_uid()).unwrap();

        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }

    #[tokio::test]
    async fn test_symlinked_directory_refused() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        let link = tmp.path().join("link");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let result = EventSocket::bind(&link.join("event.sock"), my_uid());
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");
        let stale = StdUnixDatagram::bind(&path).unwrap();
        drop(stale);
        assert!(path.exists());

        let _socket = EventSocket::bind(&path, my_uid()).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_live_socket_not_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");
        let first = EventSocket::bind(&path, my_uid()).unwrap();

        let err = EventSocket::bind(&path, my_uid()).unwrap_err();
        assert!(
            matches!(&err, TransportError::Io(e) if e.kind() == io::ErrorKind::AddrInUse),
            "unexpected error: {err:?}"
        );

        // The running socket still owns the path.
        let sender = StdUnixDatagram::unbound().unwrap();
        sender
            .send_to(&message::encode(&sample_event()).unwrap(), &path)
            .unwrap();
        let (event, _) = first.recv_event().await.unwrap();
        assert_eq!(event, sample_event());
    }

    #[tokio::test]
    async fn test_abstract_name_in_use_refused() {
        let name = format!("@hotplugd-test-in-use-{}", std::process::id());
        let _first = EventSocket::bind(Path::new(&name), my_uid()).unwrap();

        let err = EventSocket::bind(Path::new(&name), my_uid()).unwrap_err();
        assert!(
            matches!(&err, TransportError::Io(e) if e.kind() == io::ErrorKind::AddrInUse),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_regular_file_not_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let result = EventSocket::bind(&path, my_uid());
        assert!(matches!(result, Err(TransportError::Io(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }

    #[tokio::test]
    async fn test_cleanup_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");

        let socket = EventSocket::bind(&path, my_uid()).unwrap();
        assert!(path.exists());
        drop(socket);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_recv_event_from_trusted_sender() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");
        let socket = EventSocket::bind(&path, my_uid()).unwrap();

        let sender = StdUnixDatagram::unbound().unwrap();
        let bytes = message::encode(&sample_event()).unwrap();
        sender.send_to(&bytes, &path).unwrap();

        let (event, creds) = socket.recv_event().await.unwrap();
        assert_eq!(event, sample_event());
        assert_eq!(creds.uid, my_uid());
        assert_eq!(creds.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_untrusted_sender_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");
        let socket = EventSocket::bind(&path, my_uid().wrapping_add(1)).unwrap();

        let sender = StdUnixDatagram::unbound().unwrap();
        let bytes = message::encode(&sample_event()).unwrap();
        sender.send_to(&bytes, &path).unwrap();

        let err = socket.recv_event().await.unwrap_err();
        assert!(
            matches!(err, TransportError::Untrusted { uid } if uid == my_uid()),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn test_malformed_datagram_rejected_then_next_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("event.sock");
        let socket = EventSocket::bind(&path, my_uid()).unwrap();

        let sender = StdUnixDatagram::unbound().unwrap();
        sender.send_to(b"short", &path).unwrap();
        let mut oversized = message::encode(&sample_event()).unwrap();
        oversized.extend_from_slice(&[0u8; 16]);
        sender.send_to(&oversized, &path).unwrap();
        sender
            .send_to(&message::encode(&sample_event()).unwrap(), &path)
            .unwrap();

        assert!(matches!(
            socket.recv_event().await,
            Err(TransportError::Message(MessageError::WrongSize { actual: 5, .. }))
        ));
        assert!(matches!(
            socket.recv_event().await,
            Err(TransportError::Message(MessageError::WrongSize { .. }))
        ));
        let (event, _) = socket.recv_event().await.unwrap();
        assert_eq!(event, sample_event());
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let tmp = TempDir::new().unwrap();
        let socket = EventSocket::bind(&tmp.path().join("event.sock"), my_uid()).unwrap();

        let received = Received {
            bytes: message::encode(&sample_event()).unwrap(),
            credentials: None,
        };
        assert!(matches!(
            socket.validate(&received),
            Err(TransportError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn test_abstract_namespace() {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::net::SocketAddr;

        let name = format!("hotplugd-test-{}", std::process::id());
        let socket = EventSocket::bind(Path::new(&format!("@{name}")), my_uid()).unwrap();
        assert_eq!(socket.path(), None);

        let sender = StdUnixDatagram::unbound().unwrap();
        let addr = SocketAddr::from_abstract_name(name.as_bytes()).unwrap();
        sender
            .send_to_addr(&message::encode(&sample_event()).unwrap(), &addr)
            .unwrap();

        let (event, _) = socket.recv_event().await.unwrap();
        assert_eq!(event, sample_event());
        socket.cleanup().unwrap();
    }
}
