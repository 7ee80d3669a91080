//! Wire codecs and protocol data types for the RF Microblog Protocol.
//!
//! Everything in this crate is sans-IO: stateful decoders accept bytes and
//! yield frames, pure functions derive identities and timestamps, and the
//! fragmenter is a plain map the caller drives with its own clock. The
//! daemon crate wires these into the TNC connection and the store.
//!
//! Layering, innermost first:
//!
//! - [`kiss`] — octet framing to/from the TNC byte stream
//! - [`ax25`] — UI frames with shifted-callsign addresses
//! - [`frames`] — the pipe-delimited RFMP text format
//! - [`message`] — message model and SHA-256 identity
//! - [`fragment`] — splitting and reassembling oversize messages

pub mod ax25;
pub mod errors;
pub mod fragment;
pub mod frames;
pub mod kiss;
pub mod message;

pub use ax25::{Ax25Address, Ax25Frame, RFMP_DESTINATION};
pub use errors::ProtocolError;
pub use fragment::{FragmentCollector, Fragmenter};
pub use frames::{
    FragFrame, FrameType, MAX_PRIORITY, MsgFrame, ReqFrame, RfmpFrame, SYNC_FILTER_LEN,
    SYNC_WINDOW_COUNT, SyncFrame,
};
pub use kiss::{KissDecoder, KissFrame};
pub use message::{Message, format_timestamp, generate_message_id, parse_timestamp};
