//! Persistent state for the daemon.
//!
//! Trait-based abstraction over the logical tables: messages, fragments,
//! nodes, channels, users, request tracking, Bloom windows, the transmission
//! queue and the seen-cache. The trait is synchronous; implementations share
//! state via `Arc`, so clones operate on the same underlying store.
//!
//! Two invariants live here rather than in the orchestrator, because only
//! the store can make them atomic:
//!
//! - [`Store::mark_seen_if_new`] is the deduplication primitive: exactly one
//!   caller ever observes `true` for a given key
//! - [`Store::next_transmission`] claims a queue row and flips it to
//!   `transmitting` in one step, so concurrent dequeuers get distinct rows

mod memory;
mod redb;

use chrono::{DateTime, TimeDelta, Utc};
pub use memory::MemoryStore;
use rfmp_core::WindowSnapshot;
use rfmp_proto::FrameType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::redb::RedbStore;

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database or filesystem failure.
    #[error("store I/O error: {0}")]
    Io(String),

    /// A record failed to encode or decode.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Result of [`Store::save_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The row was inserted and aggregates were updated.
    Inserted,
    /// A row with this id already exists; nothing changed.
    Duplicate,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Content-derived primary key.
    pub id: String,
    /// Sender as carried on the wire.
    pub from_node: String,
    /// Local session nickname, only set for locally submitted messages.
    pub author: Option<String>,
    /// Wire timestamp (`YYYYMMDDTHHMMSSZ`).
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
    /// Reserved; never written by the current engine.
    pub transmitted_at: Option<DateTime<Utc>>,
    /// Times this node queued a rebroadcast.
    pub rebroadcast_count: u32,
    /// Exact wire bytes as first seen or as first transmitted.
    pub raw_frame: Vec<u8>,
}

/// Filters for [`Store::recent_messages`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Only this channel.
    pub channel: Option<String>,
    /// Only this sender.
    pub from_node: Option<String>,
    /// Maximum rows returned.
    pub limit: usize,
}

/// A stored fragment, keyed by `(message_id, idx)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRecord {
    /// Message being reassembled.
    pub message_id: String,
    /// Fragment index.
    pub idx: u32,
    /// Total fragments for this message.
    pub total: u32,
    /// Raw chunk bytes.
    pub data: Vec<u8>,
    /// When the fragment arrived.
    pub received_at: DateTime<Utc>,
}

/// Which kind of frame a node was heard sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeActivity {
    /// A MSG frame.
    Message,
    /// A SYNC frame.
    Sync,
    /// A REQ frame.
    Req,
}

/// Aggregate statistics for one heard node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Full callsign string (e.g. `N0CALL-3`).
    pub callsign: String,
    /// First activity.
    pub first_seen: DateTime<Utc>,
    /// Most recent activity.
    pub last_seen: DateTime<Utc>,
    /// Most recent SYNC frame, if any.
    pub last_sync: Option<DateTime<Utc>>,
    /// MSG frames heard.
    pub message_count: u64,
    /// SYNC frames heard.
    pub sync_count: u64,
    /// REQ frames heard.
    pub req_count: u64,
}

/// Aggregate statistics for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    /// Channel name.
    pub name: String,
    /// First accepted message.
    pub first_message: DateTime<Utc>,
    /// Most recent accepted message.
    pub last_message: DateTime<Utc>,
    /// Accepted messages.
    pub message_count: u64,
    /// Distinct senders seen in this channel.
    pub unique_nodes: u64,
}

/// Aggregate statistics for one application-level author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Nickname.
    pub username: String,
    /// First activity.
    pub first_seen: DateTime<Utc>,
    /// Most recent activity.
    pub last_seen: DateTime<Utc>,
    /// Messages posted.
    pub message_count: u64,
}

/// Durable mirror of the in-memory REQ limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTrackingRecord {
    /// Requested message id.
    pub message_id: String,
    /// First REQ sent.
    pub first_request: DateTime<Utc>,
    /// Most recent REQ sent.
    pub last_request: DateTime<Utc>,
    /// Retries after the first request.
    pub retry_count: u32,
    /// Current backoff, seconds.
    pub backoff_secs: u32,
    /// Whether the message eventually arrived.
    pub success: bool,
}

/// Lifecycle of a transmission-queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionStatus {
    /// Waiting for its scheduled time.
    Pending,
    /// Claimed by the transmission loop.
    Transmitting,
    /// Handed to the connector.
    Sent,
    /// Could not be encoded or sent.
    Failed,
}

/// One queued outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmissionRecord {
    /// Queue row id.
    pub id: u64,
    /// Frame type tag, for logging and diagnostics.
    pub frame_type: String,
    /// Serialized RFMP wire bytes.
    pub frame_data: Vec<u8>,
    /// Priority 0-3, 0 most urgent.
    pub priority: u8,
    /// Earliest transmit time.
    pub scheduled_at: DateTime<Utc>,
    /// When the row was queued.
    pub created_at: DateTime<Utc>,
    /// Claim attempts so far.
    pub attempts: u32,
    /// Row status.
    pub status: TransmissionStatus,
}

/// Storage abstraction over the daemon's logical tables.
///
/// Must be `Clone + Send + Sync`: the orchestrator, the transmission loop
/// and the cleanup loop all hold handles. All mutations are transactional in
/// the backing engine; the dedup and dequeue primitives are race-free.
pub trait Store: Clone + Send + Sync + 'static {
    /// Insert a message if its id is unknown.
    ///
    /// On insert, channel and node aggregates are upserted in the same
    /// logical operation. A duplicate id is a normal outcome, not an error.
    fn save_message(&self, record: &MessageRecord) -> Result<SaveOutcome, StoreError>;

    /// Fetch one message by id.
    fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StoreError>;

    /// Recent messages ordered by `received_at` descending, with optional
    /// channel/sender filters.
    fn recent_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>, StoreError>;

    /// Total stored messages.
    fn message_count(&self) -> Result<u64, StoreError>;

    /// `reply_to` ids referenced by the most recent `scan_limit` messages
    /// but absent from the message table. These are ids this node knows
    /// exist and can ask peers for.
    fn dangling_reply_ids(&self, scan_limit: usize) -> Result<Vec<String>, StoreError>;

    /// Insert a fragment; `false` when `(message_id, idx)` already exists.
    fn save_fragment(&self, record: &FragmentRecord) -> Result<bool, StoreError>;

    /// All fragments for a message, ascending by index.
    fn fragments(&self, message_id: &str) -> Result<Vec<FragmentRecord>, StoreError>;

    /// Delete fragments older than `max_age`. Returns rows removed.
    fn cleanup_old_fragments(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Upsert per-node counters and `last_seen` (`last_sync` for
    /// [`NodeActivity::Sync`]).
    fn update_node_stats(
        &self,
        callsign: &str,
        activity: NodeActivity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Nodes heard within `window`, most recent first.
    fn active_nodes(
        &self,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<Vec<NodeRecord>, StoreError>;

    /// All known channels, most recently active first.
    fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError>;

    /// Upsert per-author counters.
    fn update_user_stats(&self, username: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Queue a frame for transmission at `scheduled_at`. Returns the row id.
    fn queue_transmission(
        &self,
        frame_type: FrameType,
        frame_data: &[u8],
        priority: u8,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Atomically claim the next eligible row.
    ///
    /// Among rows with `status = pending` and `scheduled_at <= now`, the row
    /// with the lowest priority value (numeric 0 is protocol-highest) wins,
    /// ties broken by earliest `scheduled_at`, then row id. The returned row
    /// has already been flipped to `transmitting`; concurrent callers
    /// receive distinct rows.
    fn next_transmission(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<TransmissionRecord>, StoreError>;

    /// Update a claimed row's status.
    fn mark_transmission(&self, id: u64, status: TransmissionStatus) -> Result<(), StoreError>;

    /// Rows still `pending`.
    fn pending_transmission_count(&self) -> Result<u64, StoreError>;

    /// Reset rows stuck in `transmitting` longer than `max_age` back to
    /// `pending`, bumping `attempts`. Janitor for connector failures.
    fn revive_stale_transmissions(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Delete `sent`/`failed` rows older than `max_age`.
    fn cleanup_transmissions(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Atomically insert `(message_id, fragment_idx)` into the seen-cache.
    ///
    /// Returns `true` only when the key was newly inserted. This is the
    /// deduplication primitive: for any key, exactly one caller ever gets
    /// `true`.
    fn mark_seen_if_new(
        &self,
        message_id: &str,
        fragment_idx: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Whether a message-level seen entry carries the rebroadcast flag.
    fn is_marked_rebroadcast(&self, message_id: &str) -> Result<bool, StoreError>;

    /// Set the rebroadcast flag on a message-level seen entry, creating the
    /// entry if needed.
    fn mark_rebroadcast(&self, message_id: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete seen-cache entries older than `max_age`.
    fn cleanup_seen_cache(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Record a REQ send, mirroring the in-memory limiter: retry count is
    /// bumped and backoff doubles (capped at 600 s). Returns the updated
    /// record.
    fn track_request(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RequestTrackingRecord, StoreError>;

    /// Mark a tracked request as satisfied.
    fn mark_request_success(&self, message_id: &str) -> Result<(), StoreError>;

    /// Delete request-tracking rows older than `max_age`.
    fn cleanup_request_tracking(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Persist the rotating Bloom windows (newest first) and the current
    /// window index.
    fn save_bloom_state(
        &self,
        snapshots: &[WindowSnapshot],
        current_index: u8,
    ) -> Result<(), StoreError>;

    /// Load persisted Bloom windows, if any.
    fn load_bloom_state(&self) -> Result<Option<(Vec<WindowSnapshot>, u8)>, StoreError>;
}

/// Shared upsert arithmetic for node stats, used by both backends.
pub(crate) fn apply_node_activity(
    record: &mut NodeRecord,
    activity: NodeActivity,
    now: DateTime<Utc>,
) {
    record.last_seen = now;
    match activity {
        NodeActivity::Message => record.message_count += 1,
        NodeActivity::Sync => {
            record.last_sync = Some(now);
            record.sync_count += 1;
        }
        NodeActivity::Req => record.req_count += 1,
    }
}

/// Fresh node record for a first sighting.
pub(crate) fn new_node_record(
    callsign: &str,
    activity: NodeActivity,
    now: DateTime<Utc>,
) -> NodeRecord {
    let mut record = NodeRecord {
        callsign: callsign.to_string(),
        first_seen: now,
        last_seen: now,
        last_sync: None,
        message_count: 0,
        sync_count: 0,
        req_count: 0,
    };
    apply_node_activity(&mut record, activity, now);
    record
}

/// Shared backoff arithmetic for request tracking, mirroring the in-memory
/// limiter.
pub(crate) fn apply_request_attempt(
    existing: Option<RequestTrackingRecord>,
    message_id: &str,
    now: DateTime<Utc>,
) -> RequestTrackingRecord {
    match existing {
        Some(mut record) => {
            record.last_request = now;
            record.retry_count += 1;
            record.backoff_secs = (record.backoff_secs * 2).min(600);
            record
        }
        None => RequestTrackingRecord {
            message_id: message_id.to_string(),
            first_request: now,
            last_request: now,
            retry_count: 0,
            backoff_secs: 30,
            success: false,
        },
    }
}

/// Ordering key for transmission dequeue: priority ascending (numeric 0 is
/// protocol-highest), then scheduled time, then row id.
pub(crate) fn dequeue_key(record: &TransmissionRecord) -> (u8, DateTime<Utc>, u64) {
    (record.priority, record.scheduled_at, record.id)
}
