//! Protocol error types.

use thiserror::Error;

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced by the KISS, AX.25 and RFMP codecs.
///
/// Ingress handling never propagates these past the decode boundary: a frame
/// that fails to decode is dropped and counted, the byte stream continues.
/// Egress construction surfaces them to the caller so an invalid message is
/// rejected before it is queued.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A FESC inside a KISS frame was followed by neither TFEND nor TFESC.
    #[error("invalid KISS escape sequence")]
    InvalidKissEscape,

    /// KISS frame contained no bytes after unescaping.
    #[error("empty KISS frame")]
    EmptyKissFrame,

    /// KISS command nibble is not one this codec understands.
    #[error("unknown KISS command nibble {0:#04x}")]
    UnknownKissCommand(u8),

    /// AX.25 frame shorter than the minimum address + control + PID layout.
    #[error("AX.25 frame too short: {0} bytes")]
    Ax25TooShort(usize),

    /// AX.25 address chain never terminated with the extension bit.
    #[error("AX.25 address chain unterminated")]
    Ax25Unterminated,

    /// Callsign is empty, longer than six characters, or not alphanumeric.
    #[error("invalid callsign {0:?}")]
    InvalidCallsign(String),

    /// SSID outside the 4-bit range.
    #[error("SSID must be 0-15, got {0}")]
    InvalidSsid(u8),

    /// RFMP frame bytes are not UTF-8.
    #[error("frame is not valid UTF-8")]
    NotUtf8,

    /// The leading type tag is not MSG, FRAG, SYNC or REQ.
    #[error("unknown frame type {0:?}")]
    UnknownFrameType(String),

    /// A required `key=value` pair is absent.
    #[error("missing field {0:?}")]
    MissingField(&'static str),

    /// A field is present but fails validation.
    #[error("invalid field {field:?}: {reason}")]
    InvalidField {
        /// Wire key of the offending field.
        field: &'static str,
        /// Human-readable reason.
        reason: String,
    },

    /// A base64-coded field does not decode.
    #[error("invalid base64 in field {0:?}")]
    InvalidBase64(&'static str),

    /// Message id is not 8-12 lowercase hex characters.
    #[error("message id must be 8-12 hex characters")]
    InvalidMessageId,

    /// Channel is not 1-20 lowercase ASCII characters.
    #[error("channel must be 1-20 lowercase ASCII characters")]
    InvalidChannel,

    /// Priority outside 0-3.
    #[error("priority must be 0-3, got {0}")]
    InvalidPriority(u8),

    /// Body is empty, longer than 1000 characters, or contains the wire
    /// delimiter.
    #[error("body must be 1-1000 characters without '|'")]
    InvalidBody,

    /// Timestamp does not match `YYYYMMDDTHHMMSSZ`.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// Fragment index is outside `0..total`.
    #[error("fragment index {idx} out of range for total {total}")]
    InvalidFragmentIndex {
        /// Offending index.
        idx: u32,
        /// Claimed fragment count.
        total: u32,
    },

    /// A fragment was offered to a collector for a different message or with
    /// a conflicting total.
    #[error("fragment does not belong to collector for {collector_id}")]
    FragmentMismatch {
        /// Message id the collector was created for.
        collector_id: String,
    },
}
