//! In-memory store implementation for testing and offline experiments.
//!
//! `HashMap`s behind one `Arc<Mutex>`; clones share state. The coarse lock
//! makes every operation trivially atomic, which is exactly what the dedup
//! and dequeue primitives require.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use rfmp_core::WindowSnapshot;
use rfmp_proto::FrameType;

use super::{
    ChannelRecord, FragmentRecord, MessageFilter, MessageRecord, NodeActivity, NodeRecord,
    RequestTrackingRecord, SaveOutcome, Store, StoreError, TransmissionRecord,
    TransmissionStatus, UserRecord, apply_node_activity, apply_request_attempt, dequeue_key,
    new_node_record,
};

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    seen_at: DateTime<Utc>,
    rebroadcast: bool,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<String, MessageRecord>,
    fragments: BTreeMap<(String, u32), FragmentRecord>,
    nodes: HashMap<String, NodeRecord>,
    channels: HashMap<String, ChannelRecord>,
    channel_nodes: HashSet<(String, String)>,
    users: HashMap<String, UserRecord>,
    requests: HashMap<String, RequestTrackingRecord>,
    queue: BTreeMap<u64, TransmissionRecord>,
    next_queue_id: u64,
    seen: HashMap<(String, Option<u32>), SeenEntry>,
    bloom: Option<(Vec<WindowSnapshot>, u8)>,
}

/// In-memory [`Store`] implementation.
///
/// # Panics
///
/// Operations panic if the internal mutex is poisoned (a thread panicked
/// while holding the lock). Acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mutex poisoned")
    }
}

impl Inner {
    fn upsert_channel(&mut self, channel: &str, from_node: &str, now: DateTime<Utc>) {
        let entry = self.channels.entry(channel.to_string()).or_insert(ChannelRecord {
            name: channel.to_string(),
            first_message: now,
            last_message: now,
            message_count: 0,
            unique_nodes: 0,
        });
        entry.last_message = now;
        entry.message_count += 1;

        if self.channel_nodes.insert((channel.to_string(), from_node.to_string())) {
            if let Some(entry) = self.channels.get_mut(channel) {
                entry.unique_nodes += 1;
            }
        }
    }

    fn upsert_node(&mut self, callsign: &str, activity: NodeActivity, now: DateTime<Utc>) {
        match self.nodes.get_mut(callsign) {
            Some(record) => apply_node_activity(record, activity, now),
            None => {
                self.nodes
                    .insert(callsign.to_string(), new_node_record(callsign, activity, now));
            }
        }
    }
}

impl Store for MemoryStore {
    fn save_message(&self, record: &MessageRecord) -> Result<SaveOutcome, StoreError> {
        let mut inner = self.lock();

        if inner.messages.contains_key(&record.id) {
            return Ok(SaveOutcome::Duplicate);
        }

        inner.messages.insert(record.id.clone(), record.clone());
        inner.upsert_channel(&record.channel, &record.from_node, record.received_at);
        inner.upsert_node(&record.from_node, NodeActivity::Message, record.received_at);

        Ok(SaveOutcome::Inserted)
    }

    fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.lock().messages.get(id).cloned())
    }

    fn recent_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock();

        let mut rows: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| filter.channel.as_ref().is_none_or(|c| &m.channel == c))
            .filter(|m| filter.from_node.as_ref().is_none_or(|n| &m.from_node == n))
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            b.received_at.cmp(&a.received_at).then_with(|| b.id.cmp(&a.id))
        });
        rows.truncate(filter.limit);

        Ok(rows)
    }

    fn message_count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().messages.len() as u64)
    }

    fn dangling_reply_ids(&self, scan_limit: usize) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();

        let mut rows: Vec<&MessageRecord> = inner.messages.values().collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));

        let mut seen = HashSet::new();
        let mut dangling = Vec::new();
        for row in rows.into_iter().take(scan_limit) {
            if let Some(reply) = &row.reply_to {
                if !inner.messages.contains_key(reply) && seen.insert(reply.clone()) {
                    dangling.push(reply.clone());
                }
            }
        }

        Ok(dangling)
    }

    fn save_fragment(&self, record: &FragmentRecord) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let key = (record.message_id.clone(), record.idx);

        if inner.fragments.contains_key(&key) {
            return Ok(false);
        }
        inner.fragments.insert(key, record.clone());
        Ok(true)
    }

    fn fragments(&self, message_id: &str) -> Result<Vec<FragmentRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .fragments
            .range((message_id.to_string(), 0)..=(message_id.to_string(), u32::MAX))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn cleanup_old_fragments(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let cutoff = now - max_age;
        let before = inner.fragments.len();
        inner.fragments.retain(|_, record| record.received_at >= cutoff);
        Ok((before - inner.fragments.len()) as u64)
    }

    fn update_node_stats(
        &self,
        callsign: &str,
        activity: NodeActivity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock().upsert_node(callsign, activity, now);
        Ok(())
    }

    fn active_nodes(
        &self,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<Vec<NodeRecord>, StoreError> {
        let inner = self.lock();
        let cutoff = now - window;

        let mut rows: Vec<NodeRecord> = inner
            .nodes
            .values()
            .filter(|node| node.last_seen > cutoff)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(rows)
    }

    fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        let inner = self.lock();
        let mut rows: Vec<ChannelRecord> = inner.channels.values().cloned().collect();
        rows.sort_by(|a, b| b.last_message.cmp(&a.last_message));
        Ok(rows)
    }

    fn update_user_stats(&self, username: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let entry = inner.users.entry(username.to_string()).or_insert(UserRecord {
            username: username.to_string(),
            first_seen: now,
            last_seen: now,
            message_count: 0,
        });
        entry.last_seen = now;
        entry.message_count += 1;
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
        let mut inner = self.lock();

        let id = inner.next_queue_id;
        inner.next_queue_id += 1;

        inner.queue.insert(
            id,
            TransmissionRecord {
                id,
                frame_type: frame_type.to_string(),
                frame_data: frame_data.to_vec(),
                priority,
                scheduled_at,
                created_at,
                attempts: 0,
                status: TransmissionStatus::Pending,
            },
        );
        Ok(id)
    }

    fn next_transmission(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<TransmissionRecord>, StoreError> {
        let mut inner = self.lock();

        let best = inner
            .queue
            .values()
            .filter(|row| row.status == TransmissionStatus::Pending && row.scheduled_at <= now)
            .min_by_key(|row| dequeue_key(row))
            .map(|row| row.id);

        let Some(id) = best else { return Ok(None) };

        // Claim under the same lock: concurrent callers see the flip.
        let row = inner.queue.get_mut(&id).ok_or_else(|| {
            StoreError::Io("claimed transmission row vanished".to_string())
        })?;
        row.status = TransmissionStatus::Transmitting;
        row.attempts += 1;
        Ok(Some(row.clone()))
    }

    fn mark_transmission(&self, id: u64, status: TransmissionStatus) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(row) = inner.queue.get_mut(&id) {
            row.status = status;
        }
        Ok(())
    }

    fn pending_transmission_count(&self) -> Result<u64, StoreError> {
        let inner = self.lock();
        Ok(inner
            .queue
            .values()
            .filter(|row| row.status == TransmissionStatus::Pending)
            .count() as u64)
    }

    fn revive_stale_transmissions(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let cutoff = now - max_age;

        let mut revived = 0;
        for row in inner.queue.values_mut() {
            if row.status == TransmissionStatus::Transmitting && row.scheduled_at < cutoff {
                row.status = TransmissionStatus::Pending;
                revived += 1;
            }
        }
        Ok(revived)
    }

    fn cleanup_transmissions(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let cutoff = now - max_age;
        let before = inner.queue.len();
        inner.queue.retain(|_, row| {
            !(matches!(row.status, TransmissionStatus::Sent | TransmissionStatus::Failed)
                && row.created_at < cutoff)
        });
        Ok((before - inner.queue.len()) as u64)
    }

    fn mark_seen_if_new(
        &self,
        message_id: &str,
        fragment_idx: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let key = (message_id.to_string(), fragment_idx);

        if inner.seen.contains_key(&key) {
            return Ok(false);
        }
        inner.seen.insert(key, SeenEntry { seen_at: now, rebroadcast: false });
        Ok(true)
    }

    fn is_marked_rebroadcast(&self, message_id: &str) -> Result<bool, StoreError> {
        let inner = self.lock();
        Ok(inner
            .seen
            .get(&(message_id.to_string(), None))
            .is_some_and(|entry| entry.rebroadcast))
    }

    fn mark_rebroadcast(&self, message_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner
            .seen
            .entry((message_id.to_string(), None))
            .or_insert(SeenEntry { seen_at: now, rebroadcast: false })
            .rebroadcast = true;
        Ok(())
    }

    fn cleanup_seen_cache(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let cutoff = now - max_age;
        let before = inner.seen.len();
        inner.seen.retain(|_, entry| entry.seen_at >= cutoff);
        Ok((before - inner.seen.len()) as u64)
    }

    fn track_request(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RequestTrackingRecord, StoreError> {
        let mut inner = self.lock();
        let updated =
            apply_request_attempt(inner.requests.get(message_id).cloned(), message_id, now);
        inner.requests.insert(message_id.to_string(), updated.clone());
        Ok(updated)
    }

    fn mark_request_success(&self, message_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(record) = inner.requests.get_mut(message_id) {
            record.success = true;
        }
        Ok(())
    }

    fn cleanup_request_tracking(
        &self,
        now: DateTime<Utc>,
        max_age: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let cutoff = now - max_age;
        let before = inner.requests.len();
        inner.requests.retain(|_, record| record.last_request >= cutoff);
        Ok((before - inner.requests.len()) as u64)
    }

    fn save_bloom_state(
        &self,
        snapshots: &[WindowSnapshot],
        current_index: u8,
    ) -> Result<(), StoreError> {
        self.lock().bloom = Some((snapshots.to_vec(), current_index));
        Ok(())
    }

    fn load_bloom_state(&self) -> Result<Option<(Vec<WindowSnapshot>, u8)>, StoreError> {
        Ok(self.lock().bloom.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
    }

    fn message(id: &str, channel: &str, from: &str, received_at: DateTime<Utc>) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            from_node: from.to_string(),
            author: None,
            timestamp: "20260801T000000Z".to_string(),
            channel: channel.to_string(),
            priority: 1,
            reply_to: None,
            body: "test".to_string(),
            received_at,
            transmitted_at: None,
            rebroadcast_count: 0,
            raw_frame: Vec::new(),
        }
    }

    #[test]
    fn save_message_is_idempotent() {
        let store = MemoryStore::new();
        let record = message("abcdef012345", "general", "N0CALL", t0());

        assert_eq!(store.save_message(&record).unwrap(), SaveOutcome::Inserted);
        assert_eq!(store.save_message(&record).unwrap(), SaveOutcome::Duplicate);
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn save_message_updates_aggregates() {
        let store = MemoryStore::new();

        store.save_message(&message("aaaaaaaaaaaa", "general", "N0CALL", t0())).unwrap();
        store
            .save_message(&message(
                "bbbbbbbbbbbb",
                "general",
                "K1ABC",
                t0() + TimeDelta::seconds(10),
            ))
            .unwrap();
        store
            .save_message(&message(
                "cccccccccccc",
                "general",
                "N0CALL",
                t0() + TimeDelta::seconds(20),
            ))
            .unwrap();

        let channels = store.channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].message_count, 3);
        assert_eq!(channels[0].unique_nodes, 2);

        let nodes = store.active_nodes(t0(), TimeDelta::hours(1)).unwrap();
        let n0 = nodes.iter().find(|n| n.callsign == "N0CALL").unwrap();
        assert_eq!(n0.message_count, 2);
    }

    #[test]
    fn recent_messages_filters_and_orders() {
        let store = MemoryStore::new();

        store.save_message(&message("aaaaaaaaaaaa", "general", "N0CALL", t0())).unwrap();
        store
            .save_message(&message("bbbbbbbbbbbb", "dx", "K1ABC", t0() + TimeDelta::seconds(5)))
            .unwrap();
        store
            .save_message(&message(
                "cccccccccccc",
                "general",
                "K1ABC",
                t0() + TimeDelta::seconds(9),
            ))
            .unwrap();

        let all = store
            .recent_messages(&MessageFilter { limit: 10, ..MessageFilter::default() })
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "cccccccccccc");

        let general = store
            .recent_messages(&MessageFilter {
                channel: Some("general".to_string()),
                limit: 10,
                from_node: None,
            })
            .unwrap();
        assert_eq!(general.len(), 2);

        let from_k1 = store
            .recent_messages(&MessageFilter {
                channel: None,
                from_node: Some("K1ABC".to_string()),
                limit: 1,
            })
            .unwrap();
        assert_eq!(from_k1.len(), 1);
        assert_eq!(from_k1[0].id, "cccccccccccc");
    }

    #[test]
    fn dangling_replies_are_reported_once() {
        let store = MemoryStore::new();

        let mut a = message("aaaaaaaaaaaa", "general", "N0CALL", t0());
        a.reply_to = Some("ffffffffffff".to_string());
        let mut b = message("bbbbbbbbbbbb", "general", "N0CALL", t0());
        b.reply_to = Some("ffffffffffff".to_string());
        let mut c = message("cccccccccccc", "general", "N0CALL", t0());
        c.reply_to = Some("aaaaaaaaaaaa".to_string());

        store.save_message(&a).unwrap();
        store.save_message(&b).unwrap();
        store.save_message(&c).unwrap();

        let dangling = store.dangling_reply_ids(100).unwrap();
        assert_eq!(dangling, vec!["ffffffffffff".to_string()]);
    }

    #[test]
    fn fragment_key_is_composite() {
        let store = MemoryStore::new();
        let frag = FragmentRecord {
            message_id: "abcdef012345".to_string(),
            idx: 0,
            total: 3,
            data: vec![1, 2, 3],
            received_at: t0(),
        };

        assert!(store.save_fragment(&frag).unwrap());
        assert!(!store.save_fragment(&frag).unwrap());

        let mut second = frag.clone();
        second.idx = 1;
        assert!(store.save_fragment(&second).unwrap());

        let rows = store.fragments("abcdef012345").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].idx, 0);
        assert_eq!(rows[1].idx, 1);
    }

    #[test]
    fn seen_cache_dedup_is_exact() {
        let store = MemoryStore::new();

        assert!(store.mark_seen_if_new("abcdef012345", None, t0()).unwrap());
        assert!(!store.mark_seen_if_new("abcdef012345", None, t0()).unwrap());

        // Fragment keys are independent of the message key.
        assert!(store.mark_seen_if_new("abcdef012345", Some(0), t0()).unwrap());
        assert!(store.mark_seen_if_new("abcdef012345", Some(1), t0()).unwrap());
        assert!(!store.mark_seen_if_new("abcdef012345", Some(0), t0()).unwrap());
    }

    #[test]
    fn rebroadcast_flag_lifecycle() {
        let store = MemoryStore::new();

        store.mark_seen_if_new("abcdef012345", None, t0()).unwrap();
        assert!(!store.is_marked_rebroadcast("abcdef012345").unwrap());

        store.mark_rebroadcast("abcdef012345", t0()).unwrap();
        assert!(store.is_marked_rebroadcast("abcdef012345").unwrap());
    }

    #[test]
    fn seen_cache_cleanup_respects_age() {
        let store = MemoryStore::new();

        store.mark_seen_if_new("aaaaaaaaaaaa", None, t0()).unwrap();
        store
            .mark_seen_if_new("bbbbbbbbbbbb", None, t0() + TimeDelta::seconds(3000))
            .unwrap();

        let removed = store
            .cleanup_seen_cache(t0() + TimeDelta::seconds(3700), TimeDelta::seconds(3600))
            .unwrap();
        assert_eq!(removed, 1);

        // The swept id becomes new again.
        assert!(store.mark_seen_if_new("aaaaaaaaaaaa", None, t0()).unwrap());
    }

    #[test]
    fn dequeue_order_is_priority_then_schedule() {
        let store = MemoryStore::new();
        let due = t0();

        store.queue_transmission(FrameType::Sync, b"s", 2, due, due).unwrap();
        store
            .queue_transmission(FrameType::Msg, b"m1", 0, due + TimeDelta::seconds(1), due)
            .unwrap();
        store.queue_transmission(FrameType::Msg, b"m0", 0, due, due).unwrap();
        store.queue_transmission(FrameType::Req, b"r", 3, due, due).unwrap();

        let now = t0() + TimeDelta::seconds(5);
        let order: Vec<Vec<u8>> = std::iter::from_fn(|| {
            store.next_transmission(now).unwrap().map(|row| row.frame_data)
        })
        .collect();

        assert_eq!(order, vec![b"m0".to_vec(), b"m1".to_vec(), b"s".to_vec(), b"r".to_vec()]);
    }

    #[test]
    fn dequeue_skips_future_rows() {
        let store = MemoryStore::new();

        store
            .queue_transmission(FrameType::Msg, b"later", 0, t0() + TimeDelta::seconds(60), t0())
            .unwrap();

        assert!(store.next_transmission(t0()).unwrap().is_none());
        assert!(store.next_transmission(t0() + TimeDelta::seconds(61)).unwrap().is_some());
    }

    #[test]
    fn claimed_rows_are_not_returned_twice() {
        let store = MemoryStore::new();
        store.queue_transmission(FrameType::Msg, b"once", 1, t0(), t0()).unwrap();

        let first = store.next_transmission(t0()).unwrap();
        assert!(first.is_some());
        assert!(store.next_transmission(t0()).unwrap().is_none());

        store.mark_transmission(first.unwrap().id, TransmissionStatus::Sent).unwrap();
        assert_eq!(store.pending_transmission_count().unwrap(), 0);
    }

    #[test]
    fn stale_transmitting_rows_are_revived() {
        let store = MemoryStore::new();
        store.queue_transmission(FrameType::Msg, b"x", 1, t0(), t0()).unwrap();

        let row = store.next_transmission(t0()).unwrap().unwrap();
        assert_eq!(row.status, TransmissionStatus::Transmitting);

        let revived = store
            .revive_stale_transmissions(t0() + TimeDelta::seconds(600), TimeDelta::seconds(300))
            .unwrap();
        assert_eq!(revived, 1);

        let again = store.next_transmission(t0() + TimeDelta::seconds(601)).unwrap().unwrap();
        assert_eq!(again.id, row.id);
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn request_tracking_mirrors_backoff() {
        let store = MemoryStore::new();

        let first = store.track_request("deadbeef0123", t0()).unwrap();
        assert_eq!(first.retry_count, 0);
        assert_eq!(first.backoff_secs, 30);

        let second = store.track_request("deadbeef0123", t0() + TimeDelta::seconds(30)).unwrap();
        assert_eq!(second.retry_count, 1);
        assert_eq!(second.backoff_secs, 60);

        store.mark_request_success("deadbeef0123").unwrap();
        // Success is recorded, and old rows age out.
        let removed = store
            .cleanup_request_tracking(t0() + TimeDelta::hours(25), TimeDelta::hours(24))
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn bloom_state_round_trips() {
        let store = MemoryStore::new();
        assert!(store.load_bloom_state().unwrap().is_none());

        let snapshots = vec![
            WindowSnapshot { window_start: t0(), filter: vec![1u8; 32] },
            WindowSnapshot { window_start: t0(), filter: vec![2u8; 32] },
            WindowSnapshot { window_start: t0(), filter: vec![3u8; 32] },
        ];
        store.save_bloom_state(&snapshots, 2).unwrap();

        let (loaded, index) = store.load_bloom_state().unwrap().unwrap();
        assert_eq!(loaded, snapshots);
        assert_eq!(index, 2);
    }
}
