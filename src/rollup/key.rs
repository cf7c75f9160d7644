use std::fmt;

use super::granularity::{Granularity, InvalidGranularity};

/// Identity of one unit of rollup work: a time slot at a granularity,
/// within a shard. Ordering is slot-index first so older windows sort
/// ahead of newer ones in the scheduled queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub granularity: Granularity,
    pub slot: u32,
    pub shard: u32,
}

impl SlotKey {
    pub fn new(granularity: Granularity, slot: u32, shard: u32) -> SlotKey {
        SlotKey {
            granularity,
            slot,
            shard,
        }
    }

    /// The containing slot at the next-coarser granularity.
    pub fn parent(self) -> Result<SlotKey, InvalidGranularity> {
        let coarser = self.granularity.coarser()?;
        let ratio = self.granularity.slots_per(coarser);
        Ok(SlotKey::new(coarser, self.slot / ratio, self.shard))
    }

    /// The slots at the next-finer granularity covered by this slot.
    pub fn children(self) -> Option<impl Iterator<Item = SlotKey>> {
        let finer = self.granularity.finer()?;
        Some(self.covered_by(finer))
    }

    /// The slots at a strictly finer granularity whose parent chain
    /// reaches this key.
    pub fn covered_by(self, finer: Granularity) -> impl Iterator<Item = SlotKey> {
        let ratio = finer.slots_per(self.granularity);
        let start = self.slot * ratio;
        let shard = self.shard;
        (start..start + ratio).map(move |slot| SlotKey::new(finer, slot, shard))
    }
}

impl Ord for SlotKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.slot
            .cmp(&other.slot)
            .then(self.granularity.cmp(&other.granularity))
            .then(self.shard.cmp(&other.shard))
    }
}

impl PartialOrd for SlotKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.granularity, self.slot, self.shard)
    }
}
