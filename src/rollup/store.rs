use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::service::RollupSource;

use super::granularity::Granularity;
use super::key::SlotKey;
use super::value::Rollup;
use super::RollupWriteContext;

/// Per-slot rollup state for every locator with data in the window.
#[derive(Debug, Default)]
struct SlotWindow {
    /// Wall-clock start of the slot's window, unix milliseconds.
    window_start_ms: u64,
    rollups: HashMap<Arc<str>, Rollup>,
}

/// In-memory rollup store backing the scheduling engine.
///
/// Ingested samples fold into finest-granularity slots; coarser slots are
/// computed on demand by merging the already-computed child slots, which
/// is safe because the schedule context never dispatches a parent while a
/// child is in flight.
///
/// Uses `DashMap` so ingestion threads lock independent slot entries
/// instead of a global mutex.
pub struct SampleStore {
    shard_count: u32,
    slots: DashMap<SlotKey, SlotWindow>,
}

impl SampleStore {
    pub fn new(shard_count: u32) -> SampleStore {
        assert!(shard_count > 0, "shard_count must be > 0");
        SampleStore {
            shard_count,
            slots: DashMap::with_capacity(1024),
        }
    }

    /// Stable shard assignment for a locator.
    ///
    /// Hash must not vary across processes or releases, so shards are
    /// derived from SHA-256 rather than the std hasher.
    pub fn shard_for(&self, locator: &str) -> u32 {
        let digest = Sha256::digest(locator.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        prefix % self.shard_count
    }

    /// Folds one raw sample into its finest-granularity slot and returns
    /// the touched slot key, which the caller reports to the schedule
    /// context as dirty.
    pub fn record(&self, locator: &str, ts_ms: u64, value: f64) -> SlotKey {
        let granularity = Granularity::finest();
        let shard = self.shard_for(locator);
        let key = SlotKey::new(granularity, granularity.slot(ts_ms), shard);
        let window_start_ms = ts_ms - ts_ms % granularity.duration_ms();

        let mut window = self.slots.entry(key).or_default();
        if window.rollups.is_empty() {
            window.window_start_ms = window_start_ms;
        } else if window_start_ms > window.window_start_ms {
            // The ring index wrapped; the stored rollups belong to the
            // previous occupancy's window and must not survive into the
            // new one.
            window.rollups.clear();
            window.window_start_ms = window_start_ms;
        } else if window_start_ms < window.window_start_ms {
            // Sample for a previous occupancy of this index; that window
            // has long since rolled or been dropped.
            return key;
        }
        if let Some(rollup) = window.rollups.get_mut(locator) {
            rollup.record(value);
        } else {
            let mut rollup = Rollup::new();
            rollup.record(value);
            window.rollups.insert(Arc::from(locator), rollup);
        }

        key
    }

    /// Computes the write contexts for one slot key.
    ///
    /// Finest slots read the ingested rollups directly. Coarser slots merge
    /// their children's stored rollups and cache the merged result so the
    /// next level up can read it.
    pub fn collect_rollups(&self, key: SlotKey) -> Vec<RollupWriteContext> {
        if key.granularity.is_finest() {
            return match self.slots.get(&key) {
                Some(window) => Self::contexts_for(key, &window),
                None => Vec::new(),
            };
        }

        let duration_ms = key.granularity.duration_ms();
        let mut merged = SlotWindow {
            window_start_ms: 0,
            rollups: HashMap::new(),
        };

        let Some(children) = key.children() else {
            return Vec::new();
        };
        for child in children {
            let Some(window) = self.slots.get(&child) else {
                continue;
            };
            // Children align to the same parent window only within one
            // ring occupancy; a child left over from the previous cycle
            // aligns older and is skipped.
            let aligned = window.window_start_ms - window.window_start_ms % duration_ms;
            if aligned < merged.window_start_ms {
                continue;
            }
            if aligned > merged.window_start_ms {
                merged.rollups.clear();
                merged.window_start_ms = aligned;
            }
            for (locator, rollup) in &window.rollups {
                merged
                    .rollups
                    .entry(Arc::clone(locator))
                    .or_default()
                    .merge(rollup);
            }
        }

        if merged.rollups.is_empty() {
            return Vec::new();
        }

        let contexts = Self::contexts_for(key, &merged);
        // TODO: evict slot entries once the coarsest ancestor has rolled,
        // instead of waiting for the ring index to be overwritten.
        self.slots.insert(key, merged);
        contexts
    }

    fn contexts_for(key: SlotKey, window: &SlotWindow) -> Vec<RollupWriteContext> {
        window
            .rollups
            .iter()
            .map(|(locator, rollup)| RollupWriteContext {
                locator: Arc::clone(locator),
                key,
                window_start_ms: window.window_start_ms,
                rollup: *rollup,
            })
            .collect()
    }
}

impl RollupSource for SampleStore {
    async fn rollups_for(&self, key: SlotKey) -> anyhow::Result<Vec<RollupWriteContext>> {
        Ok(self.collect_rollups(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_assignment_is_stable_and_bounded() {
        let store = SampleStore::new(128);
        let shard = store.shard_for("server1.cpu.user");
        assert_eq!(shard, store.shard_for("server1.cpu.user"));
        assert!(shard < 128);
    }

    #[test]
    fn test_record_folds_into_finest_slot() {
        let store = SampleStore::new(1);
        let key = store.record("m.one", 1_232_000, 4.0);
        let same = store.record("m.one", 1_233_000, 8.0);
        assert_eq!(key, same);
        assert_eq!(key.granularity, Granularity::Min5);
        assert_eq!(key.slot, 4);

        let contexts = store.collect_rollups(key);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].rollup.count, 2);
        assert_eq!(contexts[0].rollup.sum, 12.0);
        assert_eq!(contexts[0].window_start_ms, 1_200_000);
    }

    #[test]
    fn test_distinct_locators_in_one_slot() {
        let store = SampleStore::new(1);
        let key = store.record("m.one", 1_232_000, 4.0);
        store.record("m.two", 1_232_500, 1.0);

        let mut contexts = store.collect_rollups(key);
        contexts.sort_by(|a, b| a.locator.cmp(&b.locator));
        assert_eq!(contexts.len(), 2);
        assert_eq!(&*contexts[0].locator, "m.one");
        assert_eq!(&*contexts[1].locator, "m.two");
    }

    #[test]
    fn test_coarse_slot_merges_children() {
        let store = SampleStore::new(1);
        // Two samples in adjacent 5m windows under the same 20m parent.
        let first = store.record("m.one", 1_232_000, 4.0);
        let second = store.record("m.one", 1_232_000 + 5 * 60 * 1000, 10.0);
        assert_ne!(first, second);

        let parent = first.parent().expect("finest has parent");
        assert_eq!(parent, second.parent().expect("finest has parent"));

        let contexts = store.collect_rollups(parent);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].rollup.count, 2);
        assert_eq!(contexts[0].rollup.min, 4.0);
        assert_eq!(contexts[0].rollup.max, 10.0);
        // Aligned down to the 20m boundary.
        assert_eq!(contexts[0].window_start_ms, 1_200_000);
    }

    #[test]
    fn test_grandparent_reads_cached_parent() {
        let store = SampleStore::new(1);
        let finest = store.record("m.one", 1_232_000, 4.0);
        let parent = finest.parent().expect("has parent");
        assert_eq!(store.collect_rollups(parent).len(), 1);

        let grandparent = parent.parent().expect("has parent");
        let contexts = store.collect_rollups(grandparent);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].rollup.count, 1);
    }

    #[test]
    fn test_ring_reuse_replaces_previous_window() {
        let fourteen_days_ms = 14 * 24 * 60 * 60 * 1000u64;
        let store = SampleStore::new(1);

        let first = store.record("m.one", 1_232_000, 7.0);
        let second = store.record("m.one", 1_232_000 + fourteen_days_ms, 9.0);
        // Same ring index, one cycle later.
        assert_eq!(first, second);

        let contexts = store.collect_rollups(second);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].rollup.count, 1);
        assert_eq!(contexts[0].rollup.sum, 9.0);
        assert_eq!(contexts[0].window_start_ms, 1_200_000 + fourteen_days_ms);
    }

    #[test]
    fn test_sample_for_previous_occupancy_is_ignored() {
        let fourteen_days_ms = 14 * 24 * 60 * 60 * 1000u64;
        let store = SampleStore::new(1);

        let key = store.record("m.one", 1_232_000 + fourteen_days_ms, 9.0);
        store.record("m.one", 1_232_000, 7.0);

        let contexts = store.collect_rollups(key);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].rollup.count, 1);
        assert_eq!(contexts[0].rollup.sum, 9.0);
    }

    #[test]
    fn test_coarse_merge_skips_stale_child_window() {
        let fourteen_days_ms = 14 * 24 * 60 * 60 * 1000u64;
        let store = SampleStore::new(1);

        // One child from the previous ring cycle, never reused, and one
        // from the current cycle under the same parent.
        let old = store.record("m.old", 1_232_000, 3.0);
        let fresh = store.record("m.new", 1_532_000 + fourteen_days_ms, 9.0);
        assert_ne!(old, fresh);

        let parent = fresh.parent().expect("finest has parent");
        assert_eq!(parent, old.parent().expect("finest has parent"));

        let contexts = store.collect_rollups(parent);
        assert_eq!(contexts.len(), 1);
        assert_eq!(&*contexts[0].locator, "m.new");
        assert_eq!(contexts[0].window_start_ms, 1_200_000 + fourteen_days_ms);
    }

    #[test]
    #[should_panic(expected = "shard_count")]
    fn test_zero_shard_count_is_rejected() {
        SampleStore::new(0);
    }

    #[test]
    fn test_empty_slot_yields_no_contexts() {
        let store = SampleStore::new(4);
        let key = SlotKey::new(Granularity::Min5, 17, 2);
        assert!(store.collect_rollups(key).is_empty());
        let parent = SlotKey::new(Granularity::Min20, 4, 2);
        assert!(store.collect_rollups(parent).is_empty());
    }
}
