//! RFMP wire codec.
//!
//! The on-air format is a single UTF-8 string: `TYPE|key=value|key=value|...`
//! with `TYPE` one of MSG, FRAG, SYNC, REQ. Binary fields (fragment payloads,
//! Bloom filters) are base64-coded so values never contain `|` or `=` in a
//! position that confuses the split. Decoding validates; anything that fails
//! validation is an error the ingest path drops.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::errors::{ProtocolError, Result};

/// Wire size of one serialized Bloom filter in a SYNC frame.
pub const SYNC_FILTER_LEN: usize = 32;
/// Number of rotating windows carried in a SYNC frame.
pub const SYNC_WINDOW_COUNT: usize = 3;
/// Highest numeric priority value (numeric 0 is most urgent).
pub const MAX_PRIORITY: u8 = 3;
/// Sentinel for "no reply_to" on the wire.
const REPLY_NONE: &str = "-";

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Channel message.
    Msg,
    /// Fragment of an oversize message.
    Frag,
    /// Gossip digest of rotating Bloom filters.
    Sync,
    /// Request for a message a peer holds.
    Req,
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Msg => "MSG",
            Self::Frag => "FRAG",
            Self::Sync => "SYNC",
            Self::Req => "REQ",
        })
    }
}

impl FromStr for FrameType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MSG" => Ok(Self::Msg),
            "FRAG" => Ok(Self::Frag),
            "SYNC" => Ok(Self::Sync),
            "REQ" => Ok(Self::Req),
            other => Err(ProtocolError::UnknownFrameType(other.to_string())),
        }
    }
}

/// A channel message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFrame {
    /// 8-12 hex character message id.
    pub id: String,
    /// Sender as transmitted: a callsign, or a session nickname when the
    /// origin substituted one.
    pub from: String,
    /// `YYYYMMDDTHHMMSSZ` UTC timestamp.
    pub timestamp: String,
    /// Lowercase ASCII channel name.
    pub channel: String,
    /// Priority 0-3, 0 most urgent.
    pub priority: u8,
    /// Message id this replies to, if any.
    pub reply_to: Option<String>,
    /// UTF-8 body, 1-1000 characters.
    pub body: String,
}

/// A fragment of an oversize message's encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragFrame {
    /// Id of the message being reassembled.
    pub message_id: String,
    /// 0-based fragment index.
    pub idx: u32,
    /// Total fragment count.
    pub total: u32,
    /// Raw chunk of the encoded MSG.
    pub data: Vec<u8>,
}

/// A gossip digest carrying the three rotating Bloom filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFrame {
    /// Sending node's callsign.
    pub from: String,
    /// Serialized filters, oldest window first. Each exactly
    /// [`SYNC_FILTER_LEN`] bytes.
    pub filters: [Vec<u8>; SYNC_WINDOW_COUNT],
    /// Sender's current window index (0-2).
    pub window_index: u8,
}

/// A request for a message id a peer's SYNC implied it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqFrame {
    /// Requesting node's callsign.
    pub from: String,
    /// Message id wanted.
    pub message_id: String,
    /// Specific fragment indices wanted, when partially held.
    pub missing: Option<Vec<u32>>,
}

/// One RFMP frame of any type.
///
/// The codec is a single dispatch on the leading tag; validation happens
/// during decoding so a successfully decoded frame is structurally valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfmpFrame {
    /// Channel message.
    Msg(MsgFrame),
    /// Message fragment.
    Frag(FragFrame),
    /// Gossip digest.
    Sync(SyncFrame),
    /// Message request.
    Req(ReqFrame),
}

impl RfmpFrame {
    /// This frame's type tag.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Msg(_) => FrameType::Msg,
            Self::Frag(_) => FrameType::Frag,
            Self::Sync(_) => FrameType::Sync,
            Self::Req(_) => FrameType::Req,
        }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut parts: Vec<String> = vec![self.frame_type().to_string()];

        match self {
            Self::Msg(msg) => {
                parts.push(format!("id={}", msg.id));
                parts.push(format!("from={}", msg.from));
                parts.push(format!("time={}", msg.timestamp));
                parts.push(format!("chan={}", msg.channel));
                parts.push(format!("prio={}", msg.priority));
                parts.push(format!(
                    "reply={}",
                    msg.reply_to.as_deref().unwrap_or(REPLY_NONE)
                ));
                parts.push(format!("body={}", msg.body));
            }
            Self::Frag(frag) => {
                parts.push(format!("msgid={}", frag.message_id));
                parts.push(format!("idx={}", frag.idx));
                parts.push(format!("total={}", frag.total));
                parts.push(format!("data={}", BASE64.encode(&frag.data)));
            }
            Self::Sync(sync) => {
                parts.push(format!("from={}", sync.from));
                for (i, filter) in sync.filters.iter().enumerate() {
                    parts.push(format!("bf{i}={}", BASE64.encode(filter)));
                }
                parts.push(format!("win={}", sync.window_index));
            }
            Self::Req(req) => {
                parts.push(format!("from={}", req.from));
                parts.push(format!("msgid={}", req.message_id));
                if let Some(missing) = &req.missing {
                    let joined: Vec<String> =
                        missing.iter().map(ToString::to_string).collect();
                    parts.push(format!("missing={}", joined.join(",")));
                }
            }
        }

        parts.join("|").into_bytes()
    }

    /// Decode and validate wire bytes.
    ///
    /// Unknown `key=value` pairs are ignored; an unknown type tag or any
    /// validation failure is an error, and the caller drops the frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;

        let mut parts = text.split('|');
        let tag = parts.next().unwrap_or_default();
        let frame_type: FrameType = tag.parse()?;

        let mut fields: HashMap<&str, &str> = HashMap::new();
        for part in parts {
            if let Some((key, value)) = part.split_once('=') {
                fields.insert(key, value);
            }
        }

        match frame_type {
            FrameType::Msg => Ok(Self::Msg(decode_msg(&fields)?)),
            FrameType::Frag => Ok(Self::Frag(decode_frag(&fields)?)),
            FrameType::Sync => Ok(Self::Sync(decode_sync(&fields)?)),
            FrameType::Req => Ok(Self::Req(decode_req(&fields)?)),
        }
    }
}

fn require<'a>(fields: &HashMap<&str, &'a str>, key: &'static str) -> Result<&'a str> {
    fields.get(key).copied().ok_or(ProtocolError::MissingField(key))
}

/// Validate an 8-12 character hex message id.
pub fn validate_message_id(id: &str) -> Result<()> {
    if (8..=12).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ProtocolError::InvalidMessageId)
    }
}

/// Validate a 1-20 character lowercase-ASCII channel name.
pub fn validate_channel(channel: &str) -> Result<()> {
    let ok = (1..=20).contains(&channel.len())
        && channel
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if ok { Ok(()) } else { Err(ProtocolError::InvalidChannel) }
}

/// Validate a 1-1000 character body that is safe to embed in the pipe-
/// delimited wire form.
pub fn validate_body(body: &str) -> Result<()> {
    let chars = body.chars().count();
    if (1..=1000).contains(&chars) && !body.contains('|') {
        Ok(())
    } else {
        Err(ProtocolError::InvalidBody)
    }
}

/// Validate the `YYYYMMDDTHHMMSSZ` shape: 16 characters, `T` at position 8,
/// trailing `Z`, digits elsewhere.
pub fn validate_timestamp(ts: &str) -> Result<()> {
    let bytes = ts.as_bytes();
    let ok = bytes.len() == 16
        && bytes[8] == b'T'
        && bytes[15] == b'Z'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..15].iter().all(u8::is_ascii_digit);
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::InvalidTimestamp(ts.to_string()))
    }
}

fn validate_priority(priority: u8) -> Result<()> {
    if priority <= MAX_PRIORITY {
        Ok(())
    } else {
        Err(ProtocolError::InvalidPriority(priority))
    }
}

fn decode_msg(fields: &HashMap<&str, &str>) -> Result<MsgFrame> {
    let id = require(fields, "id")?.to_string();
    validate_message_id(&id)?;

    let timestamp = require(fields, "time")?.to_string();
    validate_timestamp(&timestamp)?;

    let channel = require(fields, "chan")?.to_string();
    validate_channel(&channel)?;

    let priority: u8 = require(fields, "prio")?.parse().map_err(|_| {
        ProtocolError::InvalidField { field: "prio", reason: "not a number".to_string() }
    })?;
    validate_priority(priority)?;

    let reply = require(fields, "reply")?;
    let reply_to = if reply == REPLY_NONE {
        None
    } else {
        validate_message_id(reply)?;
        Some(reply.to_string())
    };

    let body = require(fields, "body")?.to_string();
    validate_body(&body)?;

    Ok(MsgFrame {
        id,
        from: require(fields, "from")?.to_string(),
        timestamp,
        channel,
        priority,
        reply_to,
        body,
    })
}

fn decode_frag(fields: &HashMap<&str, &str>) -> Result<FragFrame> {
    let message_id = require(fields, "msgid")?.to_string();
    validate_message_id(&message_id)?;

    let idx: u32 = require(fields, "idx")?.parse().map_err(|_| {
        ProtocolError::InvalidField { field: "idx", reason: "not a number".to_string() }
    })?;
    let total: u32 = require(fields, "total")?.parse().map_err(|_| {
        ProtocolError::InvalidField { field: "total", reason: "not a number".to_string() }
    })?;

    if total == 0 || idx >= total {
        return Err(ProtocolError::InvalidFragmentIndex { idx, total });
    }

    let data = BASE64
        .decode(require(fields, "data")?)
        .map_err(|_| ProtocolError::InvalidBase64("data"))?;

    Ok(FragFrame { message_id, idx, total, data })
}

fn decode_sync(fields: &HashMap<&str, &str>) -> Result<SyncFrame> {
    let from = require(fields, "from")?.to_string();

    let mut filters: [Vec<u8>; SYNC_WINDOW_COUNT] = Default::default();
    for (i, slot) in filters.iter_mut().enumerate() {
        let key: &'static str = match i {
            0 => "bf0",
            1 => "bf1",
            _ => "bf2",
        };
        let decoded = BASE64
            .decode(require(fields, key)?)
            .map_err(|_| ProtocolError::InvalidBase64(key))?;
        if decoded.len() != SYNC_FILTER_LEN {
            return Err(ProtocolError::InvalidField {
                field: key,
                reason: format!("filter must be {SYNC_FILTER_LEN} bytes, got {}", decoded.len()),
            });
        }
        *slot = decoded;
    }

    let window_index: u8 = require(fields, "win")?.parse().map_err(|_| {
        ProtocolError::InvalidField { field: "win", reason: "not a number".to_string() }
    })?;
    if window_index as usize >= SYNC_WINDOW_COUNT {
        return Err(ProtocolError::InvalidField {
            field: "win",
            reason: format!("window index must be 0-{}", SYNC_WINDOW_COUNT - 1),
        });
    }

    Ok(SyncFrame { from, filters, window_index })
}

fn decode_req(fields: &HashMap<&str, &str>) -> Result<ReqFrame> {
    let message_id = require(fields, "msgid")?.to_string();
    validate_message_id(&message_id)?;

    let missing = match fields.get("missing") {
        Some(raw) if !raw.is_empty() => {
            let mut indices = Vec::new();
            for part in raw.split(',') {
                indices.push(part.parse().map_err(|_| ProtocolError::InvalidField {
                    field: "missing",
                    reason: format!("bad index {part:?}"),
                })?);
            }
            Some(indices)
        }
        _ => None,
    };

    Ok(ReqFrame { from: require(fields, "from")?.to_string(), message_id, missing })
}
