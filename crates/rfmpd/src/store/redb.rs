//! Redb-backed durable store.
//!
//! Uses redb's ACID transactions for crash safety; all state survives
//! daemon restarts. Ordering requirements are met with composite big-endian
//! keys (lexicographic order equals numeric order), and the two atomic
//! primitives (`mark_seen_if_new`, `next_transmission`) run get-then-insert
//! inside a single write transaction, which redb serializes.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use rfmp_core::WindowSnapshot;
use rfmp_proto::FrameType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    ChannelRecord, FragmentRecord, MessageFilter, MessageRecord, NodeActivity, NodeRecord,
    RequestTrackingRecord, SaveOutcome, Store, StoreError, TransmissionRecord,
    TransmissionStatus, UserRecord, apply_node_activity, apply_request_attempt, dequeue_key,
    new_node_record,
};

/// Table: messages. Key: message id. Value: bincode `MessageRecord`.
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Table: received-order index.
/// Key: `[received_at_micros: 8 bytes BE][message id]`. Value: message id.
const MESSAGES_BY_RECEIVED: TableDefinition<&[u8], &str> =
    TableDefinition::new("messages_by_received");

/// Table: fragments. Key: `[message id][0x00][idx: 4 bytes BE]`.
const FRAGMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("fragments");

/// Table: nodes. Key: callsign.
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Table: channels. Key: channel name.
const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// Table: channel membership markers. Key: `[channel][0x00][callsign]`.
const CHANNEL_NODES: TableDefinition<&[u8], ()> = TableDefinition::new("channel_nodes");

/// Table: users. Key: nickname.
const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Table: request tracking. Key: message id.
const REQUEST_TRACKING: TableDefinition<&str, &[u8]> =
    TableDefinition::new("request_tracking");

/// Table: Bloom windows. Key: window position (0 newest).
const BLOOM_WINDOWS: TableDefinition<u8, &[u8]> = TableDefinition::new("bloom_windows");

/// Table: transmission queue. Key: row id.
const TRANSMISSION_QUEUE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("transmission_queue");

/// Table: seen cache. Key: `[message id][0x00][tag][idx: 4 bytes BE]` where
/// tag 0 means message-level (idx zeroed) and tag 1 means fragment-level.
const SEEN_CACHE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("seen_cache");

/// Table: single-row metadata (queue id counter, Bloom window index).
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_NEXT_TX_ID: &str = "next_tx_id";
const META_BLOOM_INDEX: &str = "bloom_current_index";

#[derive(Serialize, Deserialize)]
struct SeenEntry {
    seen_at: DateTime<Utc>,
    rebroadcast: bool,
}

#[derive(Serialize, Deserialize)]
struct StoredBloomWindow {
    window_start: DateTime<Utc>,
    filter: Vec<u8>,
}

/// Durable [`Store`] backed by redb.
///
/// Thread-safe through redb's internal locking; `Clone` is cheap (`Arc`).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

fn io(err: impl std::fmt::Display) -> StoreError {
    StoreError::Io(err.to_string())
}

fn enc<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn dec<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// `[received_at_micros BE][id]`, so lexicographic order is time order.
fn received_key(received_at: DateTime<Utc>, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&received_at.timestamp_micros().to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// `[id][0x00][idx BE]`. Ids are hex ASCII, so the separator is unambiguous.
fn fragment_key(message_id: &str, idx: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(message_id.len() + 5);
    key.extend_from_slice(message_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

/// `[channel][0x00][callsign]`.
fn channel_node_key(channel: &str, callsign: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(channel.len() + callsign.len() + 1);
    key.extend_from_slice(channel.as_bytes());
    key.push(0);
    key.extend_from_slice(callsign.as_bytes());
    key
}

/// `[id][0x00][tag][idx BE]`.
fn seen_key(message_id: &str, fragment_idx: Option<u32>) -> Vec<u8> {
    let mut key = Vec::with_capacity(message_id.len() + 6);
    key.extend_from_slice(message_id.as_bytes());
    key.push(0);
    match fragment_idx {
        Some(idx) => {
            key.push(1);
            key.extend_from_slice(&idx.to_be_bytes());
        }
        None => {
            key.push(0);
            key.extend_from_slice(&[0; 4]);
        }
    }
    key
}

impl RedbStore {
    /// Open or create the database and make sure every table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io)?;
            }
        }

        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            txn.open_table(MESSAGES).map_err(io)?;
            txn.open_table(MESSAGES_BY_RECEIVED).map_err(io)?;
            txn.open_table(FRAGMENTS).map_err(io)?;
            txn.open_table(NODES).map_err(io)?;
            txn.open_table(CHANNELS).map_err(io)?;
            txn.open_table(CHANNEL_NODES).map_err(io)?;
            txn.open_table(USERS).map_err(io)?;
            txn.open_table(REQUEST_TRACKING).map_err(io)?;
            txn.open_table(BLOOM_WINDOWS).map_err(io)?;
            txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;
            txn.open_table(SEEN_CACHE).map_err(io)?;
            txn.open_table(META).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl Store for RedbStore {
    fn save_message(&self, record: &MessageRecord) -> Result<SaveOutcome, StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;

            if messages.get(record.id.as_str()).map_err(io)?.is_some() {
                // Drop the uncommitted transaction; nothing changed.
                return Ok(SaveOutcome::Duplicate);
            }

            messages
                .insert(record.id.as_str(), enc(record)?.as_slice())
                .map_err(io)?;

            let mut by_received = txn.open_table(MESSAGES_BY_RECEIVED).map_err(io)?;
            by_received
                .insert(
                    received_key(record.received_at, &record.id).as_slice(),
                    record.id.as_str(),
                )
                .map_err(io)?;

            // Channel aggregate, same transaction as the insert.
            let mut channels = txn.open_table(CHANNELS).map_err(io)?;
            let mut channel = match channels.get(record.channel.as_str()).map_err(io)? {
                Some(value) => dec::<ChannelRecord>(value.value())?,
                None => ChannelRecord {
                    name: record.channel.clone(),
                    first_message: record.received_at,
                    last_message: record.received_at,
                    message_count: 0,
                    unique_nodes: 0,
                },
            };
            channel.last_message = record.received_at;
            channel.message_count += 1;

            let mut channel_nodes = txn.open_table(CHANNEL_NODES).map_err(io)?;
            let marker = channel_node_key(&record.channel, &record.from_node);
            if channel_nodes.get(marker.as_slice()).map_err(io)?.is_none() {
                channel_nodes.insert(marker.as_slice(), ()).map_err(io)?;
                channel.unique_nodes += 1;
            }
            channels
                .insert(record.channel.as_str(), enc(&channel)?.as_slice())
                .map_err(io)?;

            // Node aggregate.
            let mut nodes = txn.open_table(NODES).map_err(io)?;
            let node = match nodes.get(record.from_node.as_str()).map_err(io)? {
                Some(value) => {
                    let mut node = dec::<NodeRecord>(value.value())?;
                    apply_node_activity(&mut node, NodeActivity::Message, record.received_at);
                    node
                }
                None => {
                    new_node_record(&record.from_node, NodeActivity::Message, record.received_at)
                }
            };
            nodes
                .insert(record.from_node.as_str(), enc(&node)?.as_slice())
                .map_err(io)?;
        }

        txn.commit().map_err(io)?;
        Ok(SaveOutcome::Inserted)
    }

    fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        match table.get(id).map_err(io)? {
            Some(value) => Ok(Some(dec(value.value())?)),
            None => Ok(None),
        }
    }

    fn recent_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let messages = txn.open_table(MESSAGES).map_err(io)?;
        let by_received = txn.open_table(MESSAGES_BY_RECEIVED).map_err(io)?;

        let mut rows = Vec::new();
        for entry in by_received.iter().map_err(io)?.rev() {
            if rows.len() >= filter.limit {
                break;
            }

            let (_, id) = entry.map_err(io)?;
            let Some(value) = messages.get(id.value()).map_err(io)? else {
                continue;
            };
            let record: MessageRecord = dec(value.value())?;

            if filter.channel.as_ref().is_some_and(|c| &record.channel != c) {
                continue;
            }
            if filter.from_node.as_ref().is_some_and(|n| &record.from_node != n) {
                continue;
            }
            rows.push(record);
        }

        Ok(rows)
    }

    fn message_count(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;
        table.len().map_err(io)
    }

    fn dangling_reply_ids(&self, scan_limit: usize) -> Result<Vec<String>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let messages = txn.open_table(MESSAGES).map_err(io)?;
        let by_received = txn.open_table(MESSAGES_BY_RECEIVED).map_err(io)?;

        let mut seen = std::collections::HashSet::new();
        let mut dangling = Vec::new();

        for entry in by_received.iter().map_err(io)?.rev().take(scan_limit) {
            let (_, id) = entry.map_err(io)?;
            let Some(value) = messages.get(id.value()).map_err(io)? else {
                continue;
            };
            let record: MessageRecord = dec(value.value())?;

            if let Some(reply) = record.reply_to {
                if messages.get(reply.as_str()).map_err(io)?.is_none() && seen.insert(reply.clone())
                {
                    dangling.push(reply);
                }
            }
        }

        Ok(dangling)
    }

    fn save_fragment(&self, record: &FragmentRecord) -> Result<bool, StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        let inserted = {
            let mut table = txn.open_table(FRAGMENTS).map_err(io)?;
            let key = fragment_key(&record.message_id, record.idx);

            if table.get(key.as_slice()).map_err(io)?.is_some() {
                false
            } else {
                table.insert(key.as_slice(), enc(record)?.as_slice()).map_err(io)?;
                true
            }
        };

        txn.commit().map_err(io)?;
        Ok(inserted)
    }

    fn fragments(&self, message_id: &str) -> Result<Vec<FragmentRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(FRAGMENTS).map_err(io)?;

        let start = fragment_key(message_id, 0);
        let end = fragment_key(message_id, u32::MAX);

        let mut rows = Vec::new();
        for entry in table.range(start.as_slice()..=end.as_slice()).map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            rows.push(dec(value.value())?);
        }
        Ok(rows)
    }

    fn cleanup_old_fragments(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let cutoff = now - max_age;
        let txn = self.db.begin_write().map_err(io)?;

        let removed = {
            let mut table = txn.open_table(FRAGMENTS).map_err(io)?;

            let mut expired = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                let record: FragmentRecord = dec(value.value())?;
                if record.received_at < cutoff {
                    expired.push(key.value().to_vec());
                }
            }

            for key in &expired {
                table.remove(key.as_slice()).map_err(io)?;
            }
            expired.len() as u64
        };

        txn.commit().map_err(io)?;
        Ok(removed)
    }

    fn update_node_stats(
        &self,
        callsign: &str,
        activity: NodeActivity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut table = txn.open_table(NODES).map_err(io)?;
            let node = match table.get(callsign).map_err(io)? {
                Some(value) => {
                    let mut node = dec::<NodeRecord>(value.value())?;
                    apply_node_activity(&mut node, activity, now);
                    node
                }
                None => new_node_record(callsign, activity, now),
            };
            table.insert(callsign, enc(&node)?.as_slice()).map_err(io)?;
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn active_nodes(
        &self,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(NODES).map_err(io)?;
        let cutoff = now - window;

        let mut rows = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            let node: NodeRecord = dec(value.value())?;
            if node.last_seen > cutoff {
                rows.push(node);
            }
        }
        rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(rows)
    }

    fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(CHANNELS).map_err(io)?;

        let mut rows = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            rows.push(dec::<ChannelRecord>(value.value())?);
        }
        rows.sort_by(|a, b| b.last_message.cmp(&a.last_message));
        Ok(rows)
    }

    fn update_user_stats(&self, username: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut table = txn.open_table(USERS).map_err(io)?;
            let mut user = match table.get(username).map_err(io)? {
                Some(value) => dec::<UserRecord>(value.value())?,
                None => UserRecord {
                    username: username.to_string(),
                    first_seen: now,
                    last_seen: now,
                    message_count: 0,
                },
            };
            user.last_seen = now;
            user.message_count += 1;
            table.insert(username, enc(&user)?.as_slice()).map_err(io)?;
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn queue_transmission(
        &self,
        frame_type: FrameType,
        frame_data: &[u8],
        priority: u8,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        let id = {
            let mut meta = txn.open_table(META).map_err(io)?;
            let id = match meta.get(META_NEXT_TX_ID).map_err(io)? {
                Some(value) => dec::<u64>(value.value())?,
                None => 1,
            };
            meta.insert(META_NEXT_TX_ID, enc(&(id + 1))?.as_slice()).map_err(io)?;

            let record = TransmissionRecord {
                id,
                frame_type: frame_type.to_string(),
                frame_data: frame_data.to_vec(),
                priority,
                scheduled_at,
                created_at,
                attempts: 0,
                status: TransmissionStatus::Pending,
            };

            let mut queue = txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;
            queue.insert(id, enc(&record)?.as_slice()).map_err(io)?;
            id
        };

        txn.commit().map_err(io)?;
        Ok(id)
    }

    fn next_transmission(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<TransmissionRecord>, StoreError> {
        // Selection and the pending -> transmitting flip share one write
        // transaction, which redb serializes against all other writers.
        let txn = self.db.begin_write().map_err(io)?;

        let claimed = {
            let mut queue = txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;

            let mut best: Option<TransmissionRecord> = None;
            for entry in queue.iter().map_err(io)? {
                let (_, value) = entry.map_err(io)?;
                let record: TransmissionRecord = dec(value.value())?;

                if record.status != TransmissionStatus::Pending || record.scheduled_at > now {
                    continue;
                }
                if best.as_ref().is_none_or(|b| dequeue_key(&record) < dequeue_key(b)) {
                    best = Some(record);
                }
            }

            match best {
                Some(mut record) => {
                    record.status = TransmissionStatus::Transmitting;
                    record.attempts += 1;
                    queue.insert(record.id, enc(&record)?.as_slice()).map_err(io)?;
                    Some(record)
                }
                None => None,
            }
        };

        txn.commit().map_err(io)?;
        Ok(claimed)
    }

    fn mark_transmission(&self, id: u64, status: TransmissionStatus) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut queue = txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;
            let record = match queue.get(id).map_err(io)? {
                Some(value) => {
                    let mut record = dec::<TransmissionRecord>(value.value())?;
                    record.status = status;
                    Some(record)
                }
                None => None,
            };
            if let Some(record) = record {
                queue.insert(id, enc(&record)?.as_slice()).map_err(io)?;
            }
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn pending_transmission_count(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let queue = txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;

        let mut count = 0;
        for entry in queue.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            let record: TransmissionRecord = dec(value.value())?;
            if record.status == TransmissionStatus::Pending {
                count += 1;
            }
        }
        Ok(count)
    }

    fn revive_stale_transmissions(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let cutoff = now - max_age;
        let txn = self.db.begin_write().map_err(io)?;

        let revived = {
            let mut queue = txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;

            let mut stale = Vec::new();
            for entry in queue.iter().map_err(io)? {
                let (_, value) = entry.map_err(io)?;
                let record: TransmissionRecord = dec(value.value())?;
                if record.status == TransmissionStatus::Transmitting
                    && record.scheduled_at < cutoff
                {
                    stale.push(record);
                }
            }

            for record in &mut stale {
                record.status = TransmissionStatus::Pending;
                queue.insert(record.id, enc(record)?.as_slice()).map_err(io)?;
            }
            stale.len() as u64
        };

        txn.commit().map_err(io)?;
        Ok(revived)
    }

    fn cleanup_transmissions(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let cutoff = now - max_age;
        let txn = self.db.begin_write().map_err(io)?;

        let removed = {
            let mut queue = txn.open_table(TRANSMISSION_QUEUE).map_err(io)?;

            let mut done = Vec::new();
            for entry in queue.iter().map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                let record: TransmissionRecord = dec(value.value())?;
                if matches!(
                    record.status,
                    TransmissionStatus::Sent | TransmissionStatus::Failed
                ) && record.created_at < cutoff
                {
                    done.push(key.value());
                }
            }

            for key in &done {
                queue.remove(key).map_err(io)?;
            }
            done.len() as u64
        };

        txn.commit().map_err(io)?;
        Ok(removed)
    }

    fn mark_seen_if_new(
        &self,
        message_id: &str,
        fragment_idx: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        let inserted = {
            let mut table = txn.open_table(SEEN_CACHE).map_err(io)?;
            let key = seen_key(message_id, fragment_idx);

            if table.get(key.as_slice()).map_err(io)?.is_some() {
                false
            } else {
                let entry = SeenEntry { seen_at: now, rebroadcast: false };
                table.insert(key.as_slice(), enc(&entry)?.as_slice()).map_err(io)?;
                true
            }
        };

        txn.commit().map_err(io)?;
        Ok(inserted)
    }

    fn is_marked_rebroadcast(&self, message_id: &str) -> Result<bool, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(SEEN_CACHE).map_err(io)?;

        match table.get(seen_key(message_id, None).as_slice()).map_err(io)? {
            Some(value) => Ok(dec::<SeenEntry>(value.value())?.rebroadcast),
            None => Ok(false),
        }
    }

    fn mark_rebroadcast(&self, message_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut table = txn.open_table(SEEN_CACHE).map_err(io)?;
            let key = seen_key(message_id, None);

            let mut entry = match table.get(key.as_slice()).map_err(io)? {
                Some(value) => dec::<SeenEntry>(value.value())?,
                None => SeenEntry { seen_at: now, rebroadcast: false },
            };
            entry.rebroadcast = true;
            table.insert(key.as_slice(), enc(&entry)?.as_slice()).map_err(io)?;
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn cleanup_seen_cache(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let cutoff = now - max_age;
        let txn = self.db.begin_write().map_err(io)?;

        let removed = {
            let mut table = txn.open_table(SEEN_CACHE).map_err(io)?;

            let mut expired = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                let record: SeenEntry = dec(value.value())?;
                if record.seen_at < cutoff {
                    expired.push(key.value().to_vec());
                }
            }

            for key in &expired {
                table.remove(key.as_slice()).map_err(io)?;
            }
            expired.len() as u64
        };

        txn.commit().map_err(io)?;
        Ok(removed)
    }

    fn track_request(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RequestTrackingRecord, StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        let updated = {
            let mut table = txn.open_table(REQUEST_TRACKING).map_err(io)?;
            let existing = match table.get(message_id).map_err(io)? {
                Some(value) => Some(dec::<RequestTrackingRecord>(value.value())?),
                None => None,
            };
            let updated = apply_request_attempt(existing, message_id, now);
            table.insert(message_id, enc(&updated)?.as_slice()).map_err(io)?;
            updated
        };

        txn.commit().map_err(io)?;
        Ok(updated)
    }

    fn mark_request_success(&self, message_id: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut table = txn.open_table(REQUEST_TRACKING).map_err(io)?;
            let record = match table.get(message_id).map_err(io)? {
                Some(value) => {
                    let mut record = dec::<RequestTrackingRecord>(value.value())?;
                    record.success = true;
                    Some(record)
                }
                None => None,
            };
            if let Some(record) = record {
                table.insert(message_id, enc(&record)?.as_slice()).map_err(io)?;
            }
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn cleanup_request_tracking(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let cutoff = now - max_age;
        let txn = self.db.begin_write().map_err(io)?;

        let removed = {
            let mut table = txn.open_table(REQUEST_TRACKING).map_err(io)?;

            let mut expired = Vec::new();
            for entry in table.iter().map_err(io)? {
                let (key, value) = entry.map_err(io)?;
                let record: RequestTrackingRecord = dec(value.value())?;
                if record.last_request < cutoff {
                    expired.push(key.value().to_string());
                }
            }

            for key in &expired {
                table.remove(key.as_str()).map_err(io)?;
            }
            expired.len() as u64
        };

        txn.commit().map_err(io)?;
        Ok(removed)
    }

    fn save_bloom_state(
        &self,
        snapshots: &[WindowSnapshot],
        current_index: u8,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut windows = txn.open_table(BLOOM_WINDOWS).map_err(io)?;
            for (position, snapshot) in snapshots.iter().enumerate() {
                let stored = StoredBloomWindow {
                    window_start: snapshot.window_start,
                    filter: snapshot.filter.clone(),
                };
                windows
                    .insert(position as u8, enc(&stored)?.as_slice())
                    .map_err(io)?;
            }

            // Purge rows beyond the current window count so a geometry
            // change cannot leave stale windows behind.
            let mut stale = Vec::new();
            for entry in windows.iter().map_err(io)? {
                let (key, _) = entry.map_err(io)?;
                if key.value() as usize >= snapshots.len() {
                    stale.push(key.value());
                }
            }
            for key in stale {
                windows.remove(key).map_err(io)?;
            }

            let mut meta = txn.open_table(META).map_err(io)?;
            meta.insert(META_BLOOM_INDEX, enc(&current_index)?.as_slice()).map_err(io)?;
        }

        txn.commit().map_err(io)?;
        Ok(())
    }

    fn load_bloom_state(&self) -> Result<Option<(Vec<WindowSnapshot>, u8)>, StoreError> {
        let txn = self.db.begin_read().map_err(io)?;
        let windows = txn.open_table(BLOOM_WINDOWS).map_err(io)?;

        let mut snapshots = Vec::new();
        for entry in windows.iter().map_err(io)? {
            let (_, value) = entry.map_err(io)?;
            let stored: StoredBloomWindow = dec(value.value())?;
            snapshots.push(WindowSnapshot {
                window_start: stored.window_start,
                filter: stored.filter,
            });
        }

        if snapshots.is_empty() {
            return Ok(None);
        }

        let meta = txn.open_table(META).map_err(io)?;
        let index = match meta.get(META_BLOOM_INDEX).map_err(io)? {
            Some(value) => dec::<u8>(value.value())?,
            None => 0,
        };

        Ok(Some((snapshots, index)))
    }
}
