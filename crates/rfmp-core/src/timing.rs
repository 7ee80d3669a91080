//! Adaptive transmission timing for a shared half-duplex channel.
//!
//! Every queued frame gets a delay built from one deterministic formula plus
//! role-specific additions:
//!
//! `delay = base + U(0, jitter) + (MAX_PRIO - prio) * priority_step`
//!
//! Random jitter decorrelates stations that heard the same frame; the
//! priority term lets urgent traffic onto the channel first. The RNG is a
//! plain thread RNG, there is no cryptographic requirement here.

use std::time::Duration;

use rand::Rng as _;

/// Highest numeric priority value; numeric 0 is most urgent.
const MAX_PRIORITY: u8 = 3;
/// Priority used for SYNC frames.
const SYNC_PRIORITY: u8 = 2;
/// Priority used for REQ frames.
const REQ_PRIORITY: u8 = 3;
/// Priority used for the first fragment of a train.
const FRAGMENT_PRIORITY: u8 = 1;

/// Delay formula parameters, all in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingConfig {
    /// Fixed component of every delay.
    pub base_delay: f64,
    /// Upper bound of the uniform jitter component.
    pub jitter: f64,
    /// Extra delay per priority level below the maximum.
    pub priority_step: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self { base_delay: 0.2, jitter: 0.4, priority_step: 0.35 }
    }
}

/// Computes per-frame transmission delays.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveTiming {
    config: TimingConfig,
}

impl AdaptiveTiming {
    /// Create with explicit parameters.
    #[must_use]
    pub fn new(config: TimingConfig) -> Self {
        Self { config }
    }

    fn uniform(upper: f64) -> f64 {
        if upper > 0.0 { rand::thread_rng().gen_range(0.0..upper) } else { 0.0 }
    }

    fn uniform_between(lower: f64, upper: f64) -> f64 {
        if upper > lower { rand::thread_rng().gen_range(lower..upper) } else { lower }
    }

    /// Base delay for a frame at `priority` (clamped to 0-3).
    #[must_use]
    pub fn delay(&self, priority: u8) -> Duration {
        let priority = priority.min(MAX_PRIORITY);
        let seconds = self.config.base_delay
            + Self::uniform(self.config.jitter)
            + f64::from(MAX_PRIORITY - priority) * self.config.priority_step;
        Duration::from_secs_f64(seconds)
    }

    /// Delay for a SYNC frame: priority 2 plus up to two extra seconds of
    /// spread so periodic digests from many stations do not pile up.
    #[must_use]
    pub fn sync_delay(&self) -> Duration {
        self.delay(SYNC_PRIORITY) + Duration::from_secs_f64(Self::uniform(2.0))
    }

    /// Delay for a REQ retry: priority 3 plus `min(60, 2^retry_count)`
    /// seconds of exponential spacing.
    #[must_use]
    pub fn req_delay(&self, retry_count: u32) -> Duration {
        let backoff = 2f64.powi(retry_count.min(16) as i32).min(60.0);
        self.delay(REQ_PRIORITY) + Duration::from_secs_f64(backoff)
    }

    /// Delay for fragment `index` of a train. Fragment 0 takes the normal
    /// priority-1 delay; the rest follow closely so the train stays
    /// contiguous without transmitting in lockstep.
    #[must_use]
    pub fn fragment_delay(&self, index: u32) -> Duration {
        if index == 0 {
            self.delay(FRAGMENT_PRIORITY)
        } else {
            Duration::from_secs_f64(0.05 + Self::uniform(0.05))
        }
    }

    /// Delay for rebroadcasting a received message: the message's own
    /// priority delay plus 1-3 seconds so the original transmission
    /// completes first.
    #[must_use]
    pub fn rebroadcast_delay(&self, priority: u8) -> Duration {
        self.delay(priority) + Duration::from_secs_f64(Self::uniform_between(1.0, 3.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(priority: u8, config: TimingConfig) -> (f64, f64) {
        let fixed =
            config.base_delay + f64::from(MAX_PRIORITY - priority) * config.priority_step;
        (fixed, fixed + config.jitter)
    }

    #[test]
    fn delay_respects_formula_bounds() {
        let timing = AdaptiveTiming::default();
        let config = TimingConfig::default();

        for priority in 0..=3u8 {
            let (lo, hi) = bounds(priority, config);
            for _ in 0..50 {
                let d = timing.delay(priority).as_secs_f64();
                assert!(d >= lo && d <= hi, "priority {priority}: {d} not in [{lo}, {hi}]");
            }
        }
    }

    #[test]
    fn priority_term_scales_with_distance_from_max() {
        let config = TimingConfig::default();

        let (lo0, _) = bounds(0, config);
        let (lo3, _) = bounds(3, config);
        assert!((lo0 - lo3 - 3.0 * config.priority_step).abs() < 1e-9);
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let timing = AdaptiveTiming::new(TimingConfig {
            base_delay: 0.2,
            jitter: 0.0,
            priority_step: 0.35,
        });

        let d = timing.delay(1).as_secs_f64();
        assert!((d - (0.2 + 2.0 * 0.35)).abs() < 1e-9);
    }

    #[test]
    fn sync_delay_adds_extra_spread() {
        let timing = AdaptiveTiming::default();
        let config = TimingConfig::default();
        let (lo, hi) = bounds(2, config);

        for _ in 0..50 {
            let d = timing.sync_delay().as_secs_f64();
            assert!(d >= lo && d <= hi + 2.0);
        }
    }

    #[test]
    fn req_delay_backs_off_exponentially() {
        let timing = AdaptiveTiming::new(TimingConfig {
            base_delay: 0.0,
            jitter: 0.0,
            priority_step: 0.0,
        });

        assert!((timing.req_delay(0).as_secs_f64() - 1.0).abs() < 1e-9);
        assert!((timing.req_delay(3).as_secs_f64() - 8.0).abs() < 1e-9);
        // Capped at 60 seconds.
        assert!((timing.req_delay(10).as_secs_f64() - 60.0).abs() < 1e-9);
        assert!((timing.req_delay(32).as_secs_f64() - 60.0).abs() < 1e-9);
    }

    #[test]
    fn fragment_train_stays_contiguous() {
        let timing = AdaptiveTiming::default();
        let config = TimingConfig::default();
        let (lo, hi) = bounds(1, config);

        let first = timing.fragment_delay(0).as_secs_f64();
        assert!(first >= lo && first <= hi);

        for index in 1..5 {
            let d = timing.fragment_delay(index).as_secs_f64();
            assert!((0.05..=0.10).contains(&d));
        }
    }

    #[test]
    fn rebroadcast_yields_to_original() {
        let timing = AdaptiveTiming::default();
        let config = TimingConfig::default();
        let (lo, hi) = bounds(1, config);

        for _ in 0..50 {
            let d = timing.rebroadcast_delay(1).as_secs_f64();
            assert!(d >= lo + 1.0 && d <= hi + 3.0);
        }
    }
}
