//! The orchestrator: wires the TNC, the store, the sync engine and the
//! subscribers together.
//!
//! Owns the long-lived background activities: the ingest handler fed by the
//! connector, the periodic SYNC digest, the cleanup sweep, and the
//! transmission loop draining the store-level queue. Every mutable component
//! sits behind its own async mutex; the only hard atomicity requirement —
//! "process each new id exactly once" — is delegated to the store's
//! `mark_seen_if_new`.
//!
//! Ingest handlers run their whole critical section (dedup, persist, notify,
//! enqueue rebroadcast) before the next frame is taken, so already-persisted
//! effects stand even if a later step fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rfmp_core::bloom::{BloomFilter, RotatingBloomFilter};
use rfmp_core::rate_limit::{RateLimitConfig, RateLimiter};
use rfmp_core::timing::{AdaptiveTiming, TimingConfig};
use rfmp_proto::ax25::{Ax25Address, Ax25Frame};
use rfmp_proto::fragment::Fragmenter;
use rfmp_proto::frames::{
    FragFrame, FrameType, MsgFrame, ReqFrame, RfmpFrame, SYNC_FILTER_LEN, SYNC_WINDOW_COUNT,
    SyncFrame,
};
use rfmp_proto::message::Message;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::config::Config;
use crate::error::DaemonError;
use crate::events::{ClientMessage, PushEvent, SubscriberSet};
use crate::store::{
    ChannelRecord, FragmentRecord, MessageFilter, MessageRecord, NodeActivity, NodeRecord,
    SaveOutcome, Store, TransmissionStatus,
};
use crate::tnc::{TncConfig, TncConnector, TncEvent};

/// Wire priority used for SYNC frames.
const SYNC_PRIORITY: u8 = 2;
/// Wire priority used for REQ frames.
const REQ_PRIORITY: u8 = 3;
/// Cleanup sweep cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Idle pause when the transmission queue is empty.
const TX_IDLE_PAUSE: Duration = Duration::from_millis(100);
/// Pause after a transmission-side failure.
const TX_ERROR_PAUSE: Duration = Duration::from_secs(1);
/// Fragments and seen-cache entries are retained this long, seconds.
const RETENTION_SECS: i64 = 3600;
/// Request-tracking records are retained this long, seconds.
const REQUEST_RETENTION_SECS: i64 = 24 * 3600;
/// Rows stuck in `transmitting` longer than this are revived, seconds.
const STALE_TX_SECS: i64 = 300;
/// How many recent messages the SYNC reconciliation pass scans for dangling
/// replies.
const RECONCILE_SCAN_LIMIT: usize = 200;

/// A message submission from the upstream surface.
#[derive(Debug, Clone)]
pub struct SendMessage {
    /// Channel to post to.
    pub channel: String,
    /// Body text.
    pub body: String,
    /// Priority 0-3, 0 most urgent.
    pub priority: u8,
    /// Message id being replied to.
    pub reply_to: Option<String>,
    /// Transient session nickname.
    pub author: Option<String>,
}

impl SendMessage {
    /// A normal-priority message with no reply or nickname.
    #[must_use]
    pub fn new(channel: &str, body: &str) -> Self {
        Self {
            channel: channel.to_string(),
            body: body.to_string(),
            priority: 1,
            reply_to: None,
            author: None,
        }
    }
}

/// Daemon status snapshot for the upstream surface.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    /// Crate version.
    pub version: String,
    /// Seconds since the daemon was built.
    pub uptime_seconds: u64,
    /// Local callsign with SSID suffix.
    pub callsign: String,
    /// Whether the TNC link is up.
    pub connected_to_tnc: bool,
    /// Whether the daemon runs without a TNC.
    pub offline_mode: bool,
    /// Stored messages.
    pub message_count: u64,
    /// Queue rows waiting to transmit.
    pub pending_transmissions: u64,
    /// Registered push subscribers.
    pub subscribers: usize,
    /// Ingress frames dropped for decode errors.
    pub decode_errors: u64,
    /// Message ids with outstanding REQs.
    pub tracked_requests: usize,
    /// Rotating Bloom fill rates, newest window first.
    pub bloom_fill_rates: Vec<f64>,
}

/// The RFMP protocol engine.
///
/// Generic over the [`Store`] so tests run against [`crate::store::MemoryStore`]
/// and production against [`crate::store::RedbStore`].
pub struct Daemon<S: Store> {
    config: Config,
    store: S,
    node: Arc<RwLock<Ax25Address>>,
    bloom: Mutex<RotatingBloomFilter>,
    fragmenter: Mutex<Fragmenter>,
    timing: AdaptiveTiming,
    rate_limiter: Mutex<RateLimiter>,
    subscribers: Mutex<SubscriberSet>,
    tnc: TncConnector,
    tnc_events: Mutex<Option<mpsc::Receiver<TncEvent>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    running: AtomicBool,
    started_at: DateTime<Utc>,
    decode_errors: AtomicU64,
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::zero())
}

impl<S: Store> Daemon<S> {
    /// Build the engine: restore the rotating Bloom from the store when its
    /// geometry still matches, and spawn the TNC connector (idle until
    /// [`Daemon::start`]).
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config, store: S) -> Result<Arc<Self>, DaemonError> {
        config.validate()?;
        let node = Arc::new(RwLock::new(config.node_address()?));

        let now = Utc::now();
        let sync = &config.sync;
        let bloom = match store.load_bloom_state()? {
            Some((snapshots, index)) => RotatingBloomFilter::restore(
                sync.window_duration,
                sync.window_count,
                sync.bloom_bits,
                sync.bloom_hashes,
                &snapshots,
                index,
            )
            .unwrap_or_else(|| {
                tracing::warn!("persisted Bloom windows do not match config, starting fresh");
                RotatingBloomFilter::new(
                    sync.window_duration,
                    sync.window_count,
                    sync.bloom_bits,
                    sync.bloom_hashes,
                    now,
                )
            }),
            None => RotatingBloomFilter::new(
                sync.window_duration,
                sync.window_count,
                sync.bloom_bits,
                sync.bloom_hashes,
                now,
            ),
        };

        let (tnc, tnc_events) = TncConnector::start(
            TncConfig {
                host: config.network.direwolf_host.clone(),
                port: config.network.direwolf_port,
                reconnect_interval: Duration::from_secs(config.network.reconnect_interval),
                offline_mode: config.network.offline_mode,
            },
            Arc::clone(&node),
        );

        let timing = AdaptiveTiming::new(TimingConfig {
            base_delay: config.timing.base_delay,
            jitter: config.timing.jitter,
            priority_step: config.timing.priority_step,
        });
        let rate_limiter = RateLimiter::new(RateLimitConfig {
            max_req_per_min: config.rate_limit.max_req_per_min,
            initial_backoff_secs: config.rate_limit.initial_backoff,
            max_backoff_secs: config.rate_limit.max_backoff,
            max_retries: config.rate_limit.max_retries,
        });
        let fragmenter = Fragmenter::new(config.protocol.fragment_threshold);

        Ok(Arc::new(Self {
            config,
            store,
            node,
            bloom: Mutex::new(bloom),
            fragmenter: Mutex::new(fragmenter),
            timing,
            rate_limiter: Mutex::new(rate_limiter),
            subscribers: Mutex::new(SubscriberSet::new()),
            tnc,
            tnc_events: Mutex::new(Some(tnc_events)),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            started_at: now,
            decode_errors: AtomicU64::new(0),
        }))
    }

    /// Start the background loops. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            callsign = %self.node.read().await,
            version = env!("CARGO_PKG_VERSION"),
            "starting RFMP daemon"
        );

        let mut tasks = self.tasks.lock().await;
        if let Some(events) = self.tnc_events.lock().await.take() {
            tasks.push(tokio::spawn(Arc::clone(self).ingest_loop(events)));
        }
        tasks.push(tokio::spawn(Arc::clone(self).sync_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).cleanup_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).transmission_loop()));

        tracing::info!("RFMP daemon started");
    }

    /// Stop the background loops, drain the connector and persist the Bloom
    /// windows. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping RFMP daemon");

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.tnc.stop();

        let bloom = self.bloom.lock().await;
        if let Err(e) =
            self.store.save_bloom_state(&bloom.snapshots(), bloom.current_window_index())
        {
            tracing::warn!(error = %e, "failed to persist Bloom windows");
        }

        tracing::info!("RFMP daemon stopped");
    }

    /// Register a push subscriber.
    pub async fn subscribe(&self) -> mpsc::Receiver<PushEvent> {
        self.subscribers.lock().await.subscribe()
    }

    /// The local node address.
    pub async fn node_address(&self) -> Ax25Address {
        self.node.read().await.clone()
    }

    /// Change the local callsign and SSID; takes effect for subsequent
    /// transmissions.
    pub async fn set_node_address(
        &self,
        callsign: &str,
        ssid: u8,
    ) -> Result<Ax25Address, DaemonError> {
        let address = Ax25Address::new(callsign, ssid)?;
        *self.node.write().await = address.clone();
        tracing::info!(callsign = %address, "local identity changed");
        Ok(address)
    }

    /// Recent messages with optional filters, newest first.
    pub fn recent_messages(
        &self,
        filter: &MessageFilter,
    ) -> Result<Vec<MessageRecord>, DaemonError> {
        Ok(self.store.recent_messages(filter)?)
    }

    /// One message by id.
    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>, DaemonError> {
        Ok(self.store.get_message(id)?)
    }

    /// Nodes heard within the trailing window.
    pub fn active_nodes(&self, window_secs: u64) -> Result<Vec<NodeRecord>, DaemonError> {
        Ok(self
            .store
            .active_nodes(Utc::now(), TimeDelta::seconds(window_secs as i64))?)
    }

    /// All known channels.
    pub fn channels(&self) -> Result<Vec<ChannelRecord>, DaemonError> {
        Ok(self.store.channels()?)
    }

    /// Status snapshot for the upstream surface.
    pub async fn status(&self) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            callsign: self.node.read().await.to_string(),
            connected_to_tnc: self.tnc.is_connected(),
            offline_mode: self.config.network.offline_mode,
            message_count: self.store.message_count().unwrap_or(0),
            pending_transmissions: self.store.pending_transmission_count().unwrap_or(0),
            subscribers: self.subscribers.lock().await.len(),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            tracked_requests: self.rate_limiter.lock().await.tracked_count(),
            bloom_fill_rates: self.bloom.lock().await.fill_rates(),
        }
    }

    /// Submit a new message: derive identity, persist, mark our own id as
    /// seen-and-rebroadcast, fragment when oversize, queue the frames, and
    /// notify local subscribers immediately.
    pub async fn send_message(&self, request: SendMessage) -> Result<Message, DaemonError> {
        let now = Utc::now();
        let from_node = self.node.read().await.to_string();

        let message = Message::create(
            &from_node,
            &request.channel,
            &request.body,
            request.priority,
            request.reply_to,
            request.author,
            now,
        )?;

        let frame = message.to_frame();
        let raw = RfmpFrame::Msg(frame.clone()).encode();

        let record = MessageRecord {
            id: message.id.clone(),
            from_node: message.from_node.clone(),
            author: message.author.clone(),
            timestamp: message.timestamp.clone(),
            channel: message.channel.clone(),
            priority: message.priority,
            reply_to: message.reply_to.clone(),
            body: message.body.clone(),
            received_at: now,
            transmitted_at: None,
            rebroadcast_count: 0,
            raw_frame: raw.clone(),
        };

        if self.store.save_message(&record)? == SaveOutcome::Duplicate {
            tracing::debug!(id = %message.id, "identical message already stored");
            return Ok(message);
        }

        // Hearing our own transmission echoed back must not reprocess or
        // rebroadcast it.
        let _ = self.store.mark_seen_if_new(&message.id, None, now)?;
        self.store.mark_rebroadcast(&message.id, now)?;

        self.bloom.lock().await.add(&message.id, now);

        if let Some(author) = &message.author {
            self.store.update_user_stats(author, now)?;
        }

        let fragments = self.fragmenter.lock().await.fragment(&frame);
        if fragments.is_empty() {
            let delay = self.timing.delay(message.priority);
            self.store.queue_transmission(
                FrameType::Msg,
                &raw,
                message.priority,
                now + delta(delay),
                now,
            )?;
        } else {
            for (i, fragment) in fragments.iter().enumerate() {
                let delay = self.timing.fragment_delay(i as u32);
                self.store.queue_transmission(
                    FrameType::Frag,
                    &RfmpFrame::Frag(fragment.clone()).encode(),
                    message.priority,
                    now + delta(delay),
                    now,
                )?;
            }
        }
        tracing::info!(id = %message.id, channel = %message.channel, "message queued");

        self.subscribers
            .lock()
            .await
            .broadcast(&PushEvent::Message(ClientMessage::from(&record)));

        Ok(message)
    }

    /// Decode and dispatch one received AX.25 UI frame.
    pub async fn handle_frame(&self, ax25: Ax25Frame) {
        let frame = match RfmpFrame::decode(&ax25.info) {
            Ok(frame) => frame,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, "undecodable RFMP payload dropped");
                return;
            }
        };

        let heard_from = ax25.source.to_string();
        match frame {
            RfmpFrame::Msg(msg) => self.handle_msg(msg, ax25.info.to_vec()).await,
            RfmpFrame::Frag(frag) => self.handle_frag(frag).await,
            RfmpFrame::Sync(sync) => self.handle_sync(sync, &heard_from).await,
            RfmpFrame::Req(req) => self.handle_req(req, &heard_from).await,
        }
    }

    /// MSG ingest: dedup, persist, notify, consider rebroadcast.
    async fn handle_msg(&self, msg: MsgFrame, raw: Vec<u8>) {
        let now = Utc::now();

        match self.store.mark_seen_if_new(&msg.id, None, now) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(id = %msg.id, "duplicate message");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, id = %msg.id, "seen-cache failure, frame dropped");
                return;
            }
        }

        let record = MessageRecord {
            id: msg.id.clone(),
            from_node: msg.from.clone(),
            author: None,
            timestamp: msg.timestamp.clone(),
            channel: msg.channel.clone(),
            priority: msg.priority,
            reply_to: msg.reply_to.clone(),
            body: msg.body.clone(),
            received_at: now,
            transmitted_at: None,
            rebroadcast_count: 0,
            raw_frame: raw.clone(),
        };

        // A persist failure stops here: no notification, no rebroadcast.
        match self.store.save_message(&record) {
            Ok(SaveOutcome::Inserted) => {}
            Ok(SaveOutcome::Duplicate) => {
                tracing::debug!(id = %msg.id, "message row already present");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, id = %msg.id, "failed to persist message");
                return;
            }
        }
        tracing::info!(id = %msg.id, from = %msg.from, channel = %msg.channel, "new message");

        self.bloom.lock().await.add(&msg.id, now);

        // If this id was being chased with REQs, the chase is over.
        self.rate_limiter.lock().await.mark_success(&msg.id);
        if let Err(e) = self.store.mark_request_success(&msg.id) {
            tracing::warn!(error = %e, "request-tracking update failed");
        }

        self.subscribers
            .lock()
            .await
            .broadcast(&PushEvent::Message(ClientMessage::from(&record)));

        match self.store.is_marked_rebroadcast(&msg.id) {
            Ok(true) => {}
            Ok(false) => {
                let delay = self.timing.rebroadcast_delay(msg.priority);
                // Requeue the exact wire bytes so the original sender's
                // `from` field survives the hop.
                let queued = self.store.queue_transmission(
                    FrameType::Msg,
                    &raw,
                    msg.priority,
                    now + delta(delay),
                    now,
                );
                match queued {
                    Ok(_) => {
                        if let Err(e) = self.store.mark_rebroadcast(&msg.id, now) {
                            tracing::warn!(error = %e, "failed to set rebroadcast flag");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to queue rebroadcast"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "rebroadcast flag lookup failed"),
        }
    }

    /// FRAG ingest: dedup by `(msgid, idx)`, persist, feed the collector,
    /// and loop a completed message back through the MSG handler.
    async fn handle_frag(&self, frag: FragFrame) {
        let now = Utc::now();

        match self.store.mark_seen_if_new(&frag.message_id, Some(frag.idx), now) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(id = %frag.message_id, idx = frag.idx, "duplicate fragment");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "seen-cache failure, fragment dropped");
                return;
            }
        }

        let record = FragmentRecord {
            message_id: frag.message_id.clone(),
            idx: frag.idx,
            total: frag.total,
            data: frag.data.clone(),
            received_at: now,
        };
        if let Err(e) = self.store.save_fragment(&record) {
            tracing::warn!(error = %e, "failed to persist fragment");
        }

        let completed = self.fragmenter.lock().await.add_fragment(&frag, now).1;
        if let Some(msg) = completed {
            tracing::debug!(id = %msg.id, "message reassembled from fragments");
            let raw = RfmpFrame::Msg(msg.clone()).encode();
            Box::pin(self.handle_msg(msg, raw)).await;
        }
    }

    /// SYNC ingest: update sender stats, then reconcile. Every id we know
    /// about but do not hold (incomplete fragment trains, dangling reply
    /// references) is tested against the remote filters; positive hits
    /// become rate-limited REQs.
    async fn handle_sync(&self, sync: SyncFrame, heard_from: &str) {
        let now = Utc::now();
        tracing::debug!(from = heard_from, window = sync.window_index, "SYNC received");

        if let Err(e) = self.store.update_node_stats(heard_from, NodeActivity::Sync, now) {
            tracing::warn!(error = %e, "node stats update failed");
        }

        let remote: Vec<BloomFilter> = sync
            .filters
            .iter()
            .map(|filter| BloomFilter::from_bytes(filter, self.config.sync.bloom_hashes))
            .collect();

        let mut candidates: Vec<(String, Option<Vec<u32>>)> = self
            .fragmenter
            .lock()
            .await
            .pending()
            .into_iter()
            .map(|(id, missing)| (id, Some(missing)))
            .collect();
        match self.store.dangling_reply_ids(RECONCILE_SCAN_LIMIT) {
            Ok(ids) => candidates.extend(ids.into_iter().map(|id| (id, None))),
            Err(e) => tracing::warn!(error = %e, "dangling-reply scan failed"),
        }

        let from = self.node.read().await.to_string();
        for (id, missing) in candidates {
            if !remote.iter().any(|filter| filter.contains(&id)) {
                // The peer does not claim to hold it; nothing to ask for.
                continue;
            }

            let retries = {
                let mut limiter = self.rate_limiter.lock().await;
                if !limiter.can_send_req(Some(&id), now) {
                    tracing::debug!(id = %id, "REQ deferred by rate limiter");
                    continue;
                }
                limiter.record_req(&id, now);
                limiter.attempts(&id).unwrap_or(1).saturating_sub(1)
            };

            if let Err(e) = self.store.track_request(&id, now) {
                tracing::warn!(error = %e, "request tracking failed");
            }

            let req = RfmpFrame::Req(ReqFrame {
                from: from.clone(),
                message_id: id.clone(),
                missing,
            });
            let delay = self.timing.req_delay(retries);
            match self.store.queue_transmission(
                FrameType::Req,
                &req.encode(),
                REQ_PRIORITY,
                now + delta(delay),
                now,
            ) {
                Ok(_) => tracing::info!(id = %id, to = heard_from, "REQ queued"),
                Err(e) => tracing::warn!(error = %e, "failed to queue REQ"),
            }
        }
    }

    /// REQ ingest: if we hold the id, queue the MSG (or the requested
    /// fragments) for retransmission.
    async fn handle_req(&self, req: ReqFrame, heard_from: &str) {
        let now = Utc::now();
        tracing::debug!(from = heard_from, id = %req.message_id, "REQ received");

        if let Err(e) = self.store.update_node_stats(heard_from, NodeActivity::Req, now) {
            tracing::warn!(error = %e, "node stats update failed");
        }

        let record = match self.store.get_message(&req.message_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(id = %req.message_id, "requested message not held");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "message lookup failed");
                return;
            }
        };

        // Prefer the stored wire bytes so the original `from` (possibly a
        // session nickname) is retransmitted unchanged.
        let msg = match RfmpFrame::decode(&record.raw_frame) {
            Ok(RfmpFrame::Msg(msg)) => msg,
            _ => MsgFrame {
                id: record.id.clone(),
                from: record.from_node.clone(),
                timestamp: record.timestamp.clone(),
                channel: record.channel.clone(),
                priority: record.priority,
                reply_to: record.reply_to.clone(),
                body: record.body.clone(),
            },
        };

        let fragments = self.fragmenter.lock().await.fragment(&msg);
        let queued = if fragments.is_empty() {
            let delay = self.timing.delay(record.priority);
            self.store
                .queue_transmission(
                    FrameType::Msg,
                    &RfmpFrame::Msg(msg).encode(),
                    record.priority,
                    now + delta(delay),
                    now,
                )
                .map(|_| ())
        } else {
            let wanted: Vec<FragFrame> = match &req.missing {
                Some(missing) => fragments
                    .into_iter()
                    .filter(|fragment| missing.contains(&fragment.idx))
                    .collect(),
                None => fragments,
            };

            let mut outcome = Ok(());
            for (i, fragment) in wanted.iter().enumerate() {
                let delay = self.timing.fragment_delay(i as u32);
                if let Err(e) = self.store.queue_transmission(
                    FrameType::Frag,
                    &RfmpFrame::Frag(fragment.clone()).encode(),
                    record.priority,
                    now + delta(delay),
                    now,
                ) {
                    outcome = Err(e);
                    break;
                }
            }
            outcome
        };

        match queued {
            Ok(()) => tracing::info!(id = %req.message_id, to = heard_from, "REQ served"),
            Err(e) => tracing::warn!(error = %e, "failed to queue REQ response"),
        }
    }

    /// Feed connector events into the frame handlers, in arrival order.
    async fn ingest_loop(self: Arc<Self>, mut events: mpsc::Receiver<TncEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TncEvent::Connected => tracing::info!("TNC link up"),
                TncEvent::Disconnected => tracing::warn!("TNC link down"),
                TncEvent::Frame(frame) => self.handle_frame(frame).await,
            }
        }
    }

    /// Periodically queue a SYNC digest and persist the Bloom windows.
    async fn sync_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.sync.sync_interval);

        loop {
            tokio::time::sleep(interval).await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            let now = Utc::now();
            let (filters, window_index, snapshots) = {
                let mut bloom = self.bloom.lock().await;
                (bloom.filters(now), bloom.current_window_index(), bloom.snapshots())
            };

            if filters.len() != SYNC_WINDOW_COUNT
                || filters.iter().any(|filter| filter.len() != SYNC_FILTER_LEN)
            {
                tracing::warn!("Bloom geometry does not fit the SYNC wire format, skipping");
                continue;
            }
            let filters: [Vec<u8>; SYNC_WINDOW_COUNT] = match filters.try_into() {
                Ok(filters) => filters,
                Err(_) => continue,
            };

            let sync = RfmpFrame::Sync(SyncFrame {
                from: self.node.read().await.to_string(),
                filters,
                window_index,
            });

            let delay = self.timing.sync_delay();
            match self.store.queue_transmission(
                FrameType::Sync,
                &sync.encode(),
                SYNC_PRIORITY,
                now + delta(delay),
                now,
            ) {
                Ok(_) => tracing::debug!("SYNC digest queued"),
                Err(e) => tracing::warn!(error = %e, "failed to queue SYNC"),
            }

            if let Err(e) = self.store.save_bloom_state(&snapshots, window_index) {
                tracing::warn!(error = %e, "failed to persist Bloom windows");
            }
        }
    }

    /// Periodic retention sweep across every time-bounded structure.
    async fn cleanup_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let now = Utc::now();

            let retention = TimeDelta::seconds(RETENTION_SECS);
            let request_retention = TimeDelta::seconds(REQUEST_RETENTION_SECS);

            if let Err(e) = self.store.cleanup_old_fragments(now, retention) {
                tracing::warn!(error = %e, "fragment cleanup failed");
            }
            if let Err(e) = self.store.cleanup_seen_cache(now, retention) {
                tracing::warn!(error = %e, "seen-cache cleanup failed");
            }
            if let Err(e) = self.store.cleanup_request_tracking(now, request_retention) {
                tracing::warn!(error = %e, "request-tracking cleanup failed");
            }
            if let Err(e) = self.store.cleanup_transmissions(now, retention) {
                tracing::warn!(error = %e, "transmission-queue cleanup failed");
            }
            match self
                .store
                .revive_stale_transmissions(now, TimeDelta::seconds(STALE_TX_SECS))
            {
                Ok(0) => {}
                Ok(revived) => tracing::info!(revived, "revived stuck transmissions"),
                Err(e) => tracing::warn!(error = %e, "transmission janitor failed"),
            }

            let expired = self.fragmenter.lock().await.cleanup_expired(now);
            if !expired.is_empty() {
                tracing::debug!(count = expired.len(), "expired fragment collectors");
            }

            self.rate_limiter.lock().await.cleanup_old_records(now, request_retention);
        }
    }

    /// Drain the transmission queue in store order.
    ///
    /// Offline sends are no-ops but the row is still consumed, so the queue
    /// cannot grow without bound while the TNC is absent by configuration.
    async fn transmission_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }

            match self.store.next_transmission(Utc::now()) {
                Ok(Some(row)) => match RfmpFrame::decode(&row.frame_data) {
                    Ok(frame) => {
                        self.tnc.send_frame(frame.encode()).await;
                        if let Err(e) =
                            self.store.mark_transmission(row.id, TransmissionStatus::Sent)
                        {
                            tracing::warn!(error = %e, "failed to mark row sent");
                        }
                        tracing::debug!(
                            row = row.id,
                            frame_type = %row.frame_type,
                            "frame transmitted"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, row = row.id, "queued frame is corrupt");
                        if let Err(e) =
                            self.store.mark_transmission(row.id, TransmissionStatus::Failed)
                        {
                            tracing::warn!(error = %e, "failed to mark row failed");
                        }
                        tokio::time::sleep(TX_ERROR_PAUSE).await;
                    }
                },
                Ok(None) => tokio::time::sleep(TX_IDLE_PAUSE).await,
                Err(e) => {
                    tracing::error!(error = %e, "transmission queue failure");
                    tokio::time::sleep(TX_ERROR_PAUSE).await;
                }
            }
        }
    }
}
