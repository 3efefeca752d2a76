//! Sender credentials carried with each datagram.

use nix::sys::socket::UnixCredentials;
use subtle::ConstantTimeEq;

/// Credentials the kernel attached to a received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Sender user ID.
    pub uid: u32,
    /// Sender group ID.
    pub gid: u32,
    /// Sender process ID, if the kernel reported a valid one.
    pub pid: Option<u32>,
}

impl PeerCredentials {
    /// Returns `true` if the sender runs as `trusted_uid`.
    ///
    /// Compared in constant time.
    #[must_use]
    pub fn is_uid(&self, trusted_uid: u32) -> bool {
        self.uid
            .to_ne_bytes()
            .ct_eq(&trusted_uid.to_ne_bytes())
            .unwrap_u8()
            == 1
    }
}

impl From<UnixCredentials> for PeerCredentials {
    fn from(cred: UnixCredentials) -> Self {
        Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: u32::try_from(cred.pid()).ok().filter(|&pid| pid > 0),
        }
    }
}
