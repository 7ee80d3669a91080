//! Push events for upstream clients.
//!
//! The HTTP/WebSocket surface lives outside this crate; what the core
//! provides is a subscription hook and a best-effort fan-out. Every accepted
//! MSG produces one `{"type":"message","data":{...}}` payload. Subscribers
//! that cannot keep up or have gone away are pruned on the next broadcast.

use chrono::SecondsFormat;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::store::MessageRecord;

/// Client-facing message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientMessage {
    /// Message id.
    pub id: String,
    /// Sender as carried on the wire.
    pub from_node: String,
    /// Session nickname, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Wire timestamp.
    pub timestamp: String,
    /// Channel name.
    pub channel: String,
    /// Priority 0-3.
    pub priority: u8,
    /// Message id this replies to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Body text.
    pub body: String,
    /// ISO-8601 receive time.
    pub received_at: String,
    /// ISO-8601 transmit time; reserved, currently always absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmitted_at: Option<String>,
}

impl From<&MessageRecord> for ClientMessage {
    fn from(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            from_node: record.from_node.clone(),
            author: record.author.clone(),
            timestamp: record.timestamp.clone(),
            channel: record.channel.clone(),
            priority: record.priority,
            reply_to: record.reply_to.clone(),
            body: record.body.clone(),
            received_at: record.received_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            transmitted_at: record
                .transmitted_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

/// One event on the push stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum PushEvent {
    /// A message was accepted (received or locally submitted).
    Message(ClientMessage),
}

/// Buffered events per subscriber before it is considered stalled.
const SUBSCRIBER_BUFFER: usize = 64;

/// Registered push subscribers.
///
/// Fan-out is best-effort: a subscriber whose channel is closed or full is
/// removed rather than allowed to stall the ingest path.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    senders: Vec<mpsc::Sender<PushEvent>>,
}

impl SubscriberSet {
    /// New empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and return its event stream.
    pub fn subscribe(&mut self) -> mpsc::Receiver<PushEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.senders.push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, pruning dead ones.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn broadcast(&mut self, event: &PushEvent) -> usize {
        let before = self.senders.len();
        self.senders.retain(|sender| sender.try_send(event.clone()).is_ok());

        let delivered = self.senders.len();
        if delivered < before {
            tracing::debug!(removed = before - delivered, "pruned dead subscribers");
        }
        delivered
    }

    /// Registered subscriber count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
