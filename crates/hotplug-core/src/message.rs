//! Fixed-layout wire format of inbound event messages.
//!
//! Every message is a single datagram of exactly [`MESSAGE_SIZE`] bytes:
//!
//! ```text
//! offset  size  field
//!      0    20  magic      NUL padded, must equal MAGIC
//!     20     8  sequence   i64 little-endian, -1 = unsequenced
//!     28    32  action     UTF-8, NUL terminated
//!     60   256  devpath    UTF-8, NUL terminated
//!    316    32  subsystem  UTF-8, NUL terminated
//! ```
//!
//! Sender credentials are not part of the payload; the transport carries
//! them out of band.

use thiserror::Error;

use crate::event::Event;

/// Magic tag identifying a message for this daemon and layout version.
pub const MAGIC: &str = "hotplugd-1";

/// Size of the magic field.
pub const MAGIC_SIZE: usize = 20;
/// Size of the sequence field.
pub const SEQUENCE_SIZE: usize = 8;
/// Size of the action field, including the terminating NUL.
pub const ACTION_SIZE: usize = 32;
/// Size of the devpath field, including the terminating NUL.
pub const DEVPATH_SIZE: usize = 256;
/// Size of the subsystem field, including the terminating NUL.
pub const SUBSYSTEM_SIZE: usize = 32;

/// Total size of an encoded message.
pub const MESSAGE_SIZE: usize =
    MAGIC_SIZE + SEQUENCE_SIZE + ACTION_SIZE + DEVPATH_SIZE + SUBSYSTEM_SIZE;

/// Wire value of an unsequenced event.
pub const UNSEQUENCED: i64 = -1;

const SEQUENCE_OFFSET: usize = MAGIC_SIZE;
const ACTION_OFFSET: usize = SEQUENCE_OFFSET + SEQUENCE_SIZE;
const DEVPATH_OFFSET: usize = ACTION_OFFSET + ACTION_SIZE;
const SUBSYSTEM_OFFSET: usize = DEVPATH_OFFSET + DEVPATH_SIZE;

/// Errors decoding or encoding a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The datagram does not have the fixed message size.
    #[error("message has {actual} bytes, expected {expected}")]
    WrongSize {
        /// Received length.
        actual: usize,
        /// Required length.
        expected: usize,
    },

    /// The magic tag does not match [`MAGIC`].
    #[error("message magic '{found}' doesn't match")]
    BadMagic {
        /// Printable rendering of the received tag.
        found: String,
    },

    /// The sequence is negative but not the unsequenced sentinel.
    #[error("invalid sequence number {0}")]
    InvalidSequence(i64),

    /// The sequence does not fit the signed wire field.
    #[error("sequence number {0} does not fit the wire format")]
    SequenceOverflow(u64),

    /// A string field is not valid UTF-8.
    #[error("field '{field}' is not valid UTF-8")]
    InvalidUtf8 {
        /// Field name.
        field: &'static str,
    },

    /// A required string field is empty.
    #[error("field '{field}' is empty")]
    EmptyField {
        /// Field name.
        field: &'static str,
    },

    /// A string does not fit its field with a terminating NUL.
    #[error("field '{field}' is {len} bytes, at most {max} allowed")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Encoded length.
        len: usize,
        /// Maximum length.
        max: usize,
    },
}

/// Decodes one datagram into an [`Event`].
///
/// # Errors
///
/// Returns a [`MessageError`] describing the first check that failed. The
/// caller drops the message.
pub fn decode(bytes: &[u8]) -> Result<Event, MessageError> {
    if bytes.len() != MESSAGE_SIZE {
        return Err(MessageError::WrongSize {
            actual: bytes.len(),
            expected: MESSAGE_SIZE,
        });
    }

    let magic = until_nul(&bytes[..MAGIC_SIZE]);
    if magic != MAGIC.as_bytes() {
        return Err(MessageError::BadMagic {
            found: String::from_utf8_lossy(magic).into_owned(),
        });
    }

    let mut raw = [0u8; SEQUENCE_SIZE];
    raw.copy_from_slice(&bytes[SEQUENCE_OFFSET..ACTION_OFFSET]);
    let sequence = match i64::from_le_bytes(raw) {
        UNSEQUENCED => None,
        n => Some(u64::try_from(n).map_err(|_| MessageError::InvalidSequence(n))?),
    };

    let action = read_field(bytes, ACTION_OFFSET, ACTION_SIZE, "action")?;
    let devpath = read_field(bytes, DEVPATH_OFFSET, DEVPATH_SIZE, "devpath")?;
    let subsystem = read_field(bytes, SUBSYSTEM_OFFSET, SUBSYSTEM_SIZE, "subsystem")?;

    if action.is_empty() {
        return Err(MessageError::EmptyField { field: "action" });
    }
    if devpath.is_empty() {
        return Err(MessageError::EmptyField { field: "devpath" });
    }

    Ok(Event {
        sequence,
        action,
        devpath,
        subsystem,
    })
}

/// Encodes an [`Event`] into a datagram.
///
/// # Errors
///
/// Returns [`MessageError::FieldTooLong`] if a string does not fit, or
/// [`MessageError::SequenceOverflow`] if the sequence exceeds `i64::MAX`.
pub fn encode(event: &Event) -> Result<Vec<u8>, MessageError> {
    let mut buf = vec![0u8; MESSAGE_SIZE];

    buf[..MAGIC.len()].copy_from_slice(MAGIC.as_bytes());

    let sequence = match event.sequence {
        None => UNSEQUENCED,
        Some(n) => i64::try_from(n).map_err(|_| MessageError::SequenceOverflow(n))?,
    };
    buf[SEQUENCE_OFFSET..ACTION_OFFSET].copy_from_slice(&sequence.to_le_bytes());

    write_field(&mut buf, ACTION_OFFSET, ACTION_SIZE, "action", &event.action)?;
    write_field(&mut buf, DEVPATH_OFFSET, DEVPATH_SIZE, "devpath", &event.devpath)?;
    write_field(
        &mut buf,
        SUBSYSTEM_OFFSET,
        SUBSYSTEM_SIZE,
        "subsystem",
        &event.subsystem,
    )?;

    Ok(buf)
}

fn until_nul(field: &[u8]) -> &[u8] {
    field
        .iter()
        .position(|&b| b == 0)
        .map_or(field, |end| &field[..end])
}

fn read_field(
    bytes: &[u8],
    offset: usize,
    size: usize,
    field: &'static str,
) -> Result<String, MessageError> {
    let slot = &bytes[offset..offset + size];
    let Some(end) = slot.iter().position(|&b| b == 0) else {
        return Err(MessageError::FieldTooLong {
            field,
            len: size,
            max: size - 1,
        });
    };
    std::str::from_utf8(&slot[..end])
        .map(str::to_owned)
        .map_err(|_| MessageError::InvalidUtf8 { field })
}

fn write_field(
    buf: &mut [u8],
    offset: usize,
    size: usize,
    field: &'static str,
    value: &str,
) -> Result<(), MessageError> {
    let raw = value.as_bytes();
    // One byte stays reserved for the terminating NUL.
    if raw.len() >= size || raw.contains(&0) {
        return Err(MessageError::FieldTooLong {
            field,
            len: raw.len(),
            max: size - 1,
        });
    }
    buf[offset..offset + raw.len()].copy_from_slice(raw);
    Ok(())
}
