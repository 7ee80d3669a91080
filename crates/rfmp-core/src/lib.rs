//! Synchronization engine state for RFMP.
//!
//! Three sans-IO components the daemon drives with its own clock:
//!
//! - [`bloom`] — 256-bit k=3 Bloom filters and the rotating window set
//!   carried in SYNC frames
//! - [`timing`] — priority- and role-based transmission delays for
//!   collision avoidance on the shared channel
//! - [`rate_limit`] — global REQ rate cap and per-message exponential
//!   backoff
//!
//! Nothing here touches a socket, a database, or the system clock; every
//! method that depends on time takes the current instant as a parameter.

pub mod bloom;
pub mod rate_limit;
pub mod timing;

pub use bloom::{BloomFilter, RotatingBloomFilter, WindowSnapshot, murmur3_32};
pub use rate_limit::{RateLimitConfig, RateLimiter, RequestRecord};
pub use timing::{AdaptiveTiming, TimingConfig};
