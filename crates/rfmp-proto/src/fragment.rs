//! Fragmentation and reassembly of oversize messages.
//!
//! An encoded MSG that exceeds the fragment threshold is split into
//! contiguous chunks carried in FRAG frames. The chunk size leaves room for
//! the FRAG wrapper and base64 inflation so each encoded FRAG still fits
//! inside the AX.25 info field. Receivers collect fragments per message id
//! and decode the concatenation once all have arrived.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use crate::errors::{ProtocolError, Result};
use crate::frames::{FragFrame, MsgFrame, RfmpFrame};

/// Bytes reserved for the FRAG wrapper (tag, keys, base64 growth).
const FRAG_OVERHEAD: usize = 50;
/// Collectors older than this are swept.
const COLLECTOR_TIMEOUT_SECS: i64 = 300;

/// In-flight reassembly state for one message id.
///
/// # Invariants
///
/// - All accepted fragments share this collector's `total`
/// - Every stored index is `< total`
#[derive(Debug)]
pub struct FragmentCollector {
    message_id: String,
    total: u32,
    fragments: BTreeMap<u32, Vec<u8>>,
    first_seen: DateTime<Utc>,
}

impl FragmentCollector {
    fn new(message_id: String, total: u32, first_seen: DateTime<Utc>) -> Self {
        Self { message_id, total, fragments: BTreeMap::new(), first_seen }
    }

    /// Add one fragment.
    ///
    /// Returns `true` only when `idx` was unseen.
    ///
    /// # Errors
    ///
    /// `ProtocolError::FragmentMismatch` if the fragment names a different
    /// message or disagrees on `total`; `InvalidFragmentIndex` for an index
    /// outside `0..total`.
    pub fn add(&mut self, fragment: &FragFrame) -> Result<bool> {
        if fragment.message_id != self.message_id || fragment.total != self.total {
            return Err(ProtocolError::FragmentMismatch {
                collector_id: self.message_id.clone(),
            });
        }
        if fragment.idx >= self.total {
            return Err(ProtocolError::InvalidFragmentIndex {
                idx: fragment.idx,
                total: self.total,
            });
        }

        if self.fragments.contains_key(&fragment.idx) {
            return Ok(false);
        }

        self.fragments.insert(fragment.idx, fragment.data.clone());
        Ok(true)
    }

    /// Whether every index `0..total` has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.fragments.len() as u32 == self.total
    }

    /// Indices not yet received, ascending.
    #[must_use]
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total).filter(|idx| !self.fragments.contains_key(idx)).collect()
    }

    /// Whether this collector has outlived the reassembly window.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.first_seen > TimeDelta::seconds(COLLECTOR_TIMEOUT_SECS)
    }

    /// Concatenate fragments in index order. `None` until complete.
    #[must_use]
    pub fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        // BTreeMap iterates in key order, so this is index order.
        Some(self.fragments.values().flatten().copied().collect())
    }
}

/// Splits oversize messages and reassembles incoming fragments.
#[derive(Debug)]
pub struct Fragmenter {
    threshold: usize,
    collectors: HashMap<String, FragmentCollector>,
}

impl Fragmenter {
    /// Create a fragmenter with the given encoded-size threshold.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self { threshold, collectors: HashMap::new() }
    }

    /// Split a message into FRAG frames.
    ///
    /// Returns an empty vec when the encoded MSG fits under the threshold
    /// and no fragmentation is needed.
    #[must_use]
    pub fn fragment(&self, msg: &MsgFrame) -> Vec<FragFrame> {
        let encoded = RfmpFrame::Msg(msg.clone()).encode();
        if encoded.len() <= self.threshold {
            return Vec::new();
        }

        let chunk_size = self.threshold.saturating_sub(FRAG_OVERHEAD).max(1);
        let total = encoded.len().div_ceil(chunk_size) as u32;

        encoded
            .chunks(chunk_size)
            .enumerate()
            .map(|(idx, chunk)| FragFrame {
                message_id: msg.id.clone(),
                idx: idx as u32,
                total,
                data: chunk.to_vec(),
            })
            .collect()
    }

    /// Feed one received fragment.
    ///
    /// Returns `(is_new, reassembled)`. `is_new` is `true` only if this
    /// index had not been collected yet; `reassembled` carries the complete
    /// MSG once the final fragment lands and the concatenation decodes. A
    /// fragment that conflicts with its collector (different total) is
    /// ignored.
    pub fn add_fragment(
        &mut self,
        fragment: &FragFrame,
        now: DateTime<Utc>,
    ) -> (bool, Option<MsgFrame>) {
        let collector = self
            .collectors
            .entry(fragment.message_id.clone())
            .or_insert_with(|| {
                FragmentCollector::new(fragment.message_id.clone(), fragment.total, now)
            });

        let Ok(is_new) = collector.add(fragment) else {
            return (false, None);
        };

        if !collector.is_complete() {
            return (is_new, None);
        }

        // Collector lifecycle ends at reassembly whether or not the payload
        // decodes; a corrupt train should not linger until the sweep.
        let data = collector.reassemble();
        self.collectors.remove(&fragment.message_id);

        let msg = data.and_then(|bytes| match RfmpFrame::decode(&bytes) {
            Ok(RfmpFrame::Msg(msg)) => Some(msg),
            _ => None,
        });

        (is_new, msg)
    }

    /// Missing indices for a partially collected message, if any.
    #[must_use]
    pub fn missing_indices(&self, message_id: &str) -> Option<Vec<u32>> {
        self.collectors.get(message_id).map(FragmentCollector::missing_indices)
    }

    /// Ids with partial state, paired with their missing indices. Feeds the
    /// SYNC reconciliation pass.
    #[must_use]
    pub fn pending(&self) -> Vec<(String, Vec<u32>)> {
        self.collectors
            .iter()
            .map(|(id, collector)| (id.clone(), collector.missing_indices()))
            .collect()
    }

    /// Drop collectors older than the reassembly window; returns the swept
    /// ids.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .collectors
            .iter()
            .filter(|(_, collector)| collector.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.collectors.remove(id);
        }
        expired
    }

    /// Number of live collectors.
    #[must_use]
    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }
}
