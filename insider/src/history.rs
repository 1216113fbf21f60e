//! Append-only patch log for reconnection recovery.
//!
//! The canonical replica records every patch it applies. A reconnecting
//! client reports the last logical time it saw and receives only the
//! patches after that point instead of a full document rewrite.

use crate::document::Patch;

/// Timestamp-indexed log of every patch applied to the canonical replica.
///
/// Patches with a logical time go into an ordered bucket (times are
/// monotonically non-decreasing because the canonical side applies patches
/// one at a time); untimed patches (externally-triggered rewrites) go into
/// a separate bucket that is always replayed in full.
#[derive(Debug, Default)]
pub struct PatchHistory {
    timed: Vec<(u64, Patch)>,
    untimed: Vec<Patch>,
}

impl PatchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a patch in log order.
    pub fn record(&mut self, patch: Patch) {
        match patch.logical_time {
            Some(time) => {
                debug_assert!(self.timed.last().map_or(true, |(t, _)| *t <= time));
                self.timed.push((time, patch));
            }
            None => self.untimed.push(patch),
        }
    }

    /// All timed patches strictly after `last_known_time`, in log order,
    /// followed by every untimed patch.
    pub fn missed_since(&self, last_known_time: u64) -> Vec<Patch> {
        // Binary search over the ordered bucket: first index with
        // time > last_known_time.
        let start = self.timed.partition_point(|(t, _)| *t <= last_known_time);
        self.timed[start..]
            .iter()
            .map(|(_, p)| p.clone())
            .chain(self.untimed.iter().cloned())
            .collect()
    }

    /// Logical time of the newest timed patch, if any.
    pub fn latest_time(&self) -> Option<u64> {
        self.timed.last().map(|(t, _)| *t)
    }

    pub fn len(&self) -> usize {
        self.timed.len() + self.untimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timed.is_empty() && self.untimed.is_empty()
    }
}
