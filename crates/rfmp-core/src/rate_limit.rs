//! REQ transmission throttling.
//!
//! Two layers protect the channel from request storms: a global cap on REQ
//! sends in any trailing 60 seconds, and per-message exponential backoff
//! that permanently blocks an id after `max_retries` attempts. A rate-limit
//! denial is not an error; the engine simply defers and may try again on a
//! later SYNC.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};

/// Rate limiter parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum REQ sends in any trailing 60 seconds.
    pub max_req_per_min: u32,
    /// First per-message backoff, seconds.
    pub initial_backoff_secs: u32,
    /// Backoff ceiling, seconds.
    pub max_backoff_secs: u32,
    /// Attempts after which an id is permanently blocked.
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_req_per_min: 6,
            initial_backoff_secs: 30,
            max_backoff_secs: 600,
            max_retries: 4,
        }
    }
}

/// Per-message request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// When the first REQ for this id went out.
    pub first_attempt: DateTime<Utc>,
    /// When the latest REQ went out.
    pub last_attempt: DateTime<Utc>,
    /// REQ sends so far.
    pub attempt_count: u32,
    /// Wait before the next attempt is admitted.
    pub backoff_secs: u32,
}

/// Global and per-message REQ admission control.
///
/// All decisions are driven by caller-supplied instants; the limiter never
/// reads a clock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    history: Vec<DateTime<Utc>>,
    requests: HashMap<String, RequestRecord>,
}

impl RateLimiter {
    /// Create with the given parameters.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, history: Vec::new(), requests: HashMap::new() }
    }

    /// Whether a REQ may be sent now.
    ///
    /// Checks the global trailing-minute cap, then (when `message_id` is
    /// given) the per-message backoff and retry ceiling. Admission does not
    /// record anything; call [`RateLimiter::record_req`] once the REQ is
    /// actually queued.
    pub fn can_send_req(&mut self, message_id: Option<&str>, now: DateTime<Utc>) -> bool {
        let cutoff = now - TimeDelta::seconds(60);
        self.history.retain(|&at| at > cutoff);

        if self.history.len() as u32 >= self.config.max_req_per_min {
            return false;
        }

        let Some(id) = message_id else { return true };
        let Some(record) = self.requests.get(id) else { return true };

        if record.attempt_count >= self.config.max_retries {
            return false;
        }

        now >= record.last_attempt + TimeDelta::seconds(i64::from(record.backoff_secs))
    }

    /// Record that a REQ for `message_id` was queued at `now`.
    ///
    /// The first record starts the backoff at `initial_backoff_secs`; each
    /// subsequent record doubles it up to the ceiling.
    pub fn record_req(&mut self, message_id: &str, now: DateTime<Utc>) {
        self.history.push(now);

        match self.requests.get_mut(message_id) {
            Some(record) => {
                record.last_attempt = now;
                record.attempt_count += 1;
                record.backoff_secs =
                    (record.backoff_secs * 2).min(self.config.max_backoff_secs);
            }
            None => {
                self.requests.insert(
                    message_id.to_string(),
                    RequestRecord {
                        first_attempt: now,
                        last_attempt: now,
                        attempt_count: 1,
                        backoff_secs: self.config.initial_backoff_secs,
                    },
                );
            }
        }
    }

    /// The requested message arrived; stop tracking it.
    pub fn mark_success(&mut self, message_id: &str) {
        self.requests.remove(message_id);
    }

    /// Current backoff for an id, if tracked.
    #[must_use]
    pub fn backoff(&self, message_id: &str) -> Option<u32> {
        self.requests.get(message_id).map(|r| r.backoff_secs)
    }

    /// Attempts recorded for an id, if tracked.
    #[must_use]
    pub fn attempts(&self, message_id: &str) -> Option<u32> {
        self.requests.get(message_id).map(|r| r.attempt_count)
    }

    /// Number of ids currently tracked.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.requests.len()
    }

    /// Drop records whose last attempt is older than `max_age`.
    pub fn cleanup_old_records(&mut self, now: DateTime<Utc>, max_age: TimeDelta) {
        let cutoff = now - max_age;
        self.requests.retain(|_, record| record.last_attempt > cutoff);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
