//! Bloom filters for gossip synchronization.
//!
//! Each node summarizes the message ids it holds in a fixed 256-bit filter
//! with k=3 MurmurHash3 probes, and carries three such filters in rotating
//! time windows. Rotation bounds false-positive growth and gives natural
//! expiry of very old ids without per-id bookkeeping.
//!
//! All clock reads are caller-supplied `DateTime<Utc>` values, so tests and
//! the daemon drive the same code with different time sources.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

/// `MurmurHash3_x86_32`.
///
/// The wire format commits to this exact hash: two nodes only agree on
/// filter bits if they agree on the hash, so this is part of the protocol,
/// not an implementation detail.
#[must_use]
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in chunks.by_ref() {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, &byte) in tail.iter().enumerate() {
            k ^= u32::from(byte) << (8 * i);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// A fixed-size Bloom filter.
///
/// Bits are stored little-bit-order: bit `p` lives at byte `p / 8`, mask
/// `1 << (p % 8)`. Serialization is the raw byte array, so the wire size is
/// `num_bits / 8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Create an empty filter.
    ///
    /// # Panics
    ///
    /// `num_bits` must be a non-zero multiple of 8; configuration validation
    /// enforces this before any filter is built.
    #[must_use]
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        assert!(num_bits > 0 && num_bits % 8 == 0, "num_bits must be a multiple of 8");
        Self { bits: vec![0u8; num_bits / 8], num_bits, num_hashes }
    }

    /// Rebuild a filter from its serialized bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8], num_hashes: u32) -> Self {
        Self { bits: data.to_vec(), num_bits: data.len() * 8, num_hashes }
    }

    fn bit_position(&self, item: &str, seed: u32) -> (usize, u8) {
        let pos = murmur3_32(item.as_bytes(), seed) as usize % self.num_bits;
        (pos / 8, 1 << (pos % 8))
    }

    /// Set the k bits for `item`.
    pub fn add(&mut self, item: &str) {
        for seed in 0..self.num_hashes {
            let (byte, mask) = self.bit_position(item, seed);
            self.bits[byte] |= mask;
        }
    }

    /// Membership test. `false` is definitive; `true` may be a false
    /// positive.
    #[must_use]
    pub fn contains(&self, item: &str) -> bool {
        (0..self.num_hashes).all(|seed| {
            let (byte, mask) = self.bit_position(item, seed);
            self.bits[byte] & mask != 0
        })
    }

    /// Serialized form (wire layout of the `bf0..bf2` SYNC fields).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Reset every bit.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set_bits(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Fraction of bits set, for diagnostics.
    #[must_use]
    pub fn fill_rate(&self) -> f64 {
        f64::from(self.count_set_bits()) / self.num_bits as f64
    }

    /// Filter width in bits.
    #[must_use]
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }
}

/// Snapshot of one rotating window, used for persistence across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// When this window became current.
    pub window_start: DateTime<Utc>,
    /// Serialized filter bits.
    pub filter: Vec<u8>,
}

/// Rotating set of Bloom filters over time windows.
///
/// Position 0 is the current window; additions always land there.
/// Membership ORs across all windows. When the oldest window's age exceeds
/// `window_count * window_duration` it is dropped and a fresh window is
/// prepended, so an id fades out of the digest a bounded time after it was
/// last added.
#[derive(Debug, Clone)]
pub struct RotatingBloomFilter {
    window_duration: TimeDelta,
    window_count: usize,
    bloom_bits: usize,
    bloom_hashes: u32,
    /// Front is the current window.
    windows: VecDeque<(DateTime<Utc>, BloomFilter)>,
    current_window_index: u8,
}

impl RotatingBloomFilter {
    /// Create with windows back-dated so the structure starts in steady
    /// state: window `i` began `i * window_duration` ago.
    #[must_use]
    pub fn new(
        window_duration_secs: u32,
        window_count: usize,
        bloom_bits: usize,
        bloom_hashes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let window_duration = TimeDelta::seconds(i64::from(window_duration_secs));

        let windows = (0..window_count)
            .map(|i| {
                let start = now - window_duration * (i as i32);
                (start, BloomFilter::new(bloom_bits, bloom_hashes))
            })
            .collect();

        Self {
            window_duration,
            window_count,
            bloom_bits,
            bloom_hashes,
            windows,
            current_window_index: 0,
        }
    }

    /// Rebuild from persisted snapshots (newest first).
    ///
    /// Returns `None` when the snapshots do not match the configured
    /// geometry; the caller falls back to a fresh filter.
    #[must_use]
    pub fn restore(
        window_duration_secs: u32,
        window_count: usize,
        bloom_bits: usize,
        bloom_hashes: u32,
        snapshots: &[WindowSnapshot],
        current_window_index: u8,
    ) -> Option<Self> {
        if snapshots.len() != window_count
            || snapshots.iter().any(|s| s.filter.len() * 8 != bloom_bits)
        {
            return None;
        }

        let windows = snapshots
            .iter()
            .map(|s| (s.window_start, BloomFilter::from_bytes(&s.filter, bloom_hashes)))
            .collect();

        Some(Self {
            window_duration: TimeDelta::seconds(i64::from(window_duration_secs)),
            window_count,
            bloom_bits,
            bloom_hashes,
            windows,
            current_window_index: current_window_index % window_count as u8,
        })
    }

    /// Drop expired windows and prepend fresh ones.
    ///
    /// Runs before every read and write so callers never observe stale
    /// windows.
    fn rotate_if_needed(&mut self, now: DateTime<Utc>) {
        let limit = self.window_duration * (self.window_count as i32);

        while let Some(&(oldest_start, _)) = self.windows.back() {
            if now - oldest_start <= limit {
                break;
            }
            self.windows.pop_back();
            self.windows
                .push_front((now, BloomFilter::new(self.bloom_bits, self.bloom_hashes)));
            self.current_window_index =
                (self.current_window_index + 1) % self.window_count as u8;
        }
    }

    /// Add an id to the current window.
    pub fn add(&mut self, item: &str, now: DateTime<Utc>) {
        self.rotate_if_needed(now);
        if let Some((_, filter)) = self.windows.front_mut() {
            filter.add(item);
        }
    }

    /// Membership across every live window.
    pub fn contains(&mut self, item: &str, now: DateTime<Utc>) -> bool {
        self.rotate_if_needed(now);
        self.windows.iter().any(|(_, filter)| filter.contains(item))
    }

    /// Serialized filters oldest first, matching wire positions `bf0..bf2`.
    pub fn filters(&mut self, now: DateTime<Utc>) -> Vec<Vec<u8>> {
        self.rotate_if_needed(now);
        self.windows.iter().rev().map(|(_, filter)| filter.to_bytes()).collect()
    }

    /// Current window index carried in the SYNC `win` field.
    #[must_use]
    pub fn current_window_index(&self) -> u8 {
        self.current_window_index
    }

    /// Snapshots newest first, for persistence.
    #[must_use]
    pub fn snapshots(&self) -> Vec<WindowSnapshot> {
        self.windows
            .iter()
            .map(|(start, filter)| WindowSnapshot {
                window_start: *start,
                filter: filter.to_bytes(),
            })
            .collect()
    }

    /// Per-window fill rates newest first, for diagnostics.
    #[must_use]
    pub fn fill_rates(&self) -> Vec<f64> {
        self.windows.iter().map(|(_, filter)| filter.fill_rate()).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn murmur3_reference_vectors() {
        // Canonical MurmurHash3_x86_32 vectors; on-air compatibility depends
        // on matching them exactly.
        assert_eq!(murmur3_32(b"", 0), 0x0000_0000);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_32(b"hello, world", 0), 0x149b_bb7f);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
    }

    #[test]
    fn added_items_are_contained() {
        let mut filter = BloomFilter::new(256, 3);
        let ids = ["abcdef012345", "0123456789ab", "deadbeef0123"];

        for id in ids {
            filter.add(id);
        }
        for id in ids {
            assert!(filter.contains(id));
        }
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(256, 3);
        assert!(!filter.contains("abcdef012345"));
        assert_eq!(filter.count_set_bits(), 0);
        assert!((filter.fill_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn serialization_round_trip() {
        let mut filter = BloomFilter::new(256, 3);
        filter.add("abcdef012345");

        let bytes = filter.to_bytes();
        assert_eq!(bytes.len(), 32);

        let restored = BloomFilter::from_bytes(&bytes, 3);
        assert_eq!(restored, filter);
        assert!(restored.contains("abcdef012345"));
    }

    #[test]
    fn clear_resets_bits() {
        let mut filter = BloomFilter::new(64, 3);
        filter.add("abcdef012345");
        assert!(filter.count_set_bits() > 0);

        filter.clear();
        assert_eq!(filter.count_set_bits(), 0);
    }

    #[test]
    fn rotating_add_lands_in_current_window() {
        let mut rotating = RotatingBloomFilter::new(600, 3, 256, 3, t0());
        rotating.add("abcdef012345", t0());

        assert!(rotating.contains("abcdef012345", t0()));

        let filters = rotating.filters(t0());
        assert_eq!(filters.len(), 3);
        // Oldest first: the two back-dated windows are empty, the newest
        // carries the id.
        assert!(filters[0].iter().all(|&b| b == 0));
        assert!(filters[1].iter().all(|&b| b == 0));
        assert!(filters[2].iter().any(|&b| b != 0));
    }

    #[test]
    fn rotation_expires_old_ids() {
        // window_duration=10s, count=3: ids added at t=0 survive to t=20 and
        // are gone by t=40 once every original window rotated out.
        let mut rotating = RotatingBloomFilter::new(10, 3, 256, 3, t0());
        rotating.add("abcdef012345", t0());

        assert!(rotating.contains("abcdef012345", t0() + TimeDelta::seconds(20)));
        assert!(!rotating.contains("abcdef012345", t0() + TimeDelta::seconds(40)));
    }

    #[test]
    fn rotation_advances_window_index() {
        let mut rotating = RotatingBloomFilter::new(10, 3, 256, 3, t0());
        assert_eq!(rotating.current_window_index(), 0);

        rotating.add("abcdef012345", t0() + TimeDelta::seconds(11));
        assert_eq!(rotating.current_window_index(), 1);

        // Wrap back to 0 after window_count rotations.
        rotating.add("abcdef012345", t0() + TimeDelta::seconds(31));
        assert!(rotating.current_window_index() < 3);
    }

    #[test]
    fn snapshots_restore_round_trip() {
        let mut rotating = RotatingBloomFilter::new(600, 3, 256, 3, t0());
        rotating.add("abcdef012345", t0());

        let snapshots = rotating.snapshots();
        let index = rotating.current_window_index();

        let mut restored =
            RotatingBloomFilter::restore(600, 3, 256, 3, &snapshots, index).unwrap();
        assert!(restored.contains("abcdef012345", t0()));
        assert_eq!(restored.current_window_index(), index);
    }

    #[test]
    fn restore_rejects_geometry_mismatch() {
        let rotating = RotatingBloomFilter::new(600, 3, 256, 3, t0());
        let snapshots = rotating.snapshots();

        // Wrong window count.
        assert!(RotatingBloomFilter::restore(600, 2, 256, 3, &snapshots, 0).is_none());
        // Wrong filter width.
        assert!(RotatingBloomFilter::restore(600, 3, 512, 3, &snapshots, 0).is_none());
    }
}
