//! Message model and content-derived identity.
//!
//! A message id is the first 12 hex characters of SHA-256 over
//! `sender || timestamp || body`, where `sender` is the application-level
//! author when one was provided and the node callsign otherwise. The same
//! physical node can therefore host distinct logical identities without
//! colliding ids.

use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};

use crate::errors::{ProtocolError, Result};
use crate::frames::{self, MsgFrame};

/// Hex characters kept from the SHA-256 digest.
const ID_LEN: usize = 12;
/// Wire timestamp layout.
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Derive a message id from its identity-bearing content.
///
/// Pure function: equal inputs always produce equal ids, which is what makes
/// network-wide deduplication work.
#[must_use]
pub fn generate_message_id(sender: &str, timestamp: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(body.as_bytes());

    let digest = hasher.finalize();
    let mut id = String::with_capacity(ID_LEN);
    for byte in digest.iter().take(ID_LEN / 2) {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// Format a UTC instant as a wire timestamp (`YYYYMMDDTHHMMSSZ`).
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire timestamp back to a UTC instant.
pub fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| ProtocolError::InvalidTimestamp(timestamp.to_string()))
}

/// A complete message with local metadata, as opposed to the [`MsgFrame`]
/// wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Content-derived id.
    pub id: String,
    /// Originating node callsign (with optional SSID suffix).
    pub from_node: String,
    /// Transient application-level nickname, if one was supplied.
    pub author: Option<String>,
    /// Wire timestamp.
    pub timestamp: String,
    /// Channel name.
    pub channel: String,
    /// Priority 0-3.
    pub priority: u8,
    /// Message id this replies to.
    pub reply_to: Option<String>,
    /// Body text.
    pub body: String,
    /// When this node first saw the message.
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Create a new outbound message, stamping `now` and deriving the id.
    ///
    /// When `author` is set it becomes the identity-bearing sender, so two
    /// nicknames on one node produce distinct ids for identical text.
    ///
    /// # Errors
    ///
    /// Validation failures (channel shape, body length, priority range,
    /// reply id shape) are reported to the caller; nothing is queued for an
    /// invalid message.
    pub fn create(
        from_node: &str,
        channel: &str,
        body: &str,
        priority: u8,
        reply_to: Option<String>,
        author: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        frames::validate_channel(channel)?;
        frames::validate_body(body)?;
        if priority > frames::MAX_PRIORITY {
            return Err(ProtocolError::InvalidPriority(priority));
        }
        if let Some(reply) = &reply_to {
            frames::validate_message_id(reply)?;
        }

        let timestamp = format_timestamp(now);
        let sender_for_id = author.as_deref().unwrap_or(from_node);
        let id = generate_message_id(sender_for_id, &timestamp, body);

        Ok(Self {
            id,
            from_node: from_node.to_string(),
            author,
            timestamp,
            channel: channel.to_string(),
            priority,
            reply_to,
            body: body.to_string(),
            received_at: now,
        })
    }

    /// The wire frame for this message.
    ///
    /// The transmitted `from` is the session nickname when one exists; the
    /// identity-bearing sender is already baked into `id`.
    #[must_use]
    pub fn to_frame(&self) -> MsgFrame {
        MsgFrame {
            id: self.id.clone(),
            from: self.author.clone().unwrap_or_else(|| self.from_node.clone()),
            timestamp: self.timestamp.clone(),
            channel: self.channel.clone(),
            priority: self.priority,
            reply_to: self.reply_to.clone(),
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn id_is_sha256_prefix() {
        // sha256("N0CALL20260801T120000Zhello") via a reference
        // implementation.
        let id = generate_message_id("N0CALL", "20260801T120000Z", "hello");
        assert_eq!(id.len(), 12);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));

        let mut hasher = Sha256::new();
        hasher.update(b"N0CALL20260801T120000Zhello");
        let expected = hex::encode(hasher.finalize());
        assert_eq!(id, expected[..12]);
    }

    #[test]
    fn id_is_deterministic_and_sender_sensitive() {
        let a = generate_message_id("N0CALL", "20260801T120000Z", "hi");
        let b = generate_message_id("N0CALL", "20260801T120000Z", "hi");
        let c = generate_message_id("K1ABC", "20260801T120000Z", "hi");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn timestamp_round_trip() {
        let instant = at(2026, 8, 1, 12, 34, 56);
        let wire = format_timestamp(instant);
        assert_eq!(wire, "20260801T123456Z");
        assert_eq!(parse_timestamp(&wire).unwrap(), instant);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_timestamp("not a timestamp").is_err());
        assert!(parse_timestamp("20261301T000000Z").is_err());
    }

    #[test]
    fn create_validates_fields() {
        let now = at(2026, 8, 1, 0, 0, 0);

        assert!(Message::create("N0CALL", "General", "hi", 1, None, None, now).is_err());
        assert!(Message::create("N0CALL", "general", "", 1, None, None, now).is_err());
        assert!(Message::create("N0CALL", "general", "hi", 7, None, None, now).is_err());
        assert!(
            Message::create("N0CALL", "general", "hi", 1, Some("xyz".to_string()), None, now)
                .is_err()
        );
    }

    #[test]
    fn author_becomes_identity_and_wire_from() {
        let now = at(2026, 8, 1, 0, 0, 0);

        let plain =
            Message::create("N0CALL-2", "general", "hello", 1, None, None, now).unwrap();
        let nicked = Message::create(
            "N0CALL-2",
            "general",
            "hello",
            1,
            None,
            Some("alice".to_string()),
            now,
        )
        .unwrap();

        // Distinct logical identities on the same node.
        assert_ne!(plain.id, nicked.id);

        assert_eq!(plain.to_frame().from, "N0CALL-2");
        assert_eq!(nicked.to_frame().from, "alice");
        assert_eq!(nicked.from_node, "N0CALL-2");
    }

    #[test]
    fn frame_round_trips_through_codec() {
        let now = at(2026, 8, 1, 6, 30, 0);
        let message =
            Message::create("N0CALL", "dx", "cq cq cq", 0, None, None, now).unwrap();

        let frame = crate::frames::RfmpFrame::Msg(message.to_frame());
        let decoded = crate::frames::RfmpFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }
}
