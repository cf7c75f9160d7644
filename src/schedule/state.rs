use std::collections::HashMap;

use crate::rollup::Granularity;

/// Lifecycle stage of a slot's state-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// New data has landed since the last rollup; candidate for scheduling.
    Active,
    /// Promoted into the scheduled queue or currently executing.
    Running,
    /// Rolled up; stays in the table until touched again.
    Rolled,
}

/// Last-touched timestamp plus lifecycle stage for one slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotStamp {
    pub last_touched: u64,
    pub state: SlotState,
}

/// Per-shard record of which slots have been touched by new data and when.
///
/// Entries are never deleted, only transitioned; a touch is idempotent and
/// keeps the newest timestamp.
#[derive(Debug, Default)]
pub struct SlotStateTable {
    stamps: HashMap<(Granularity, u32), SlotStamp>,
}

impl SlotStateTable {
    /// Marks a slot dirty at `ts_ms`. Re-activates retired or in-flight
    /// entries so the slot is rolled up again after the current pass.
    pub fn touch(&mut self, granularity: Granularity, slot: u32, ts_ms: u64) {
        let stamp = self
            .stamps
            .entry((granularity, slot))
            .or_insert(SlotStamp {
                last_touched: ts_ms,
                state: SlotState::Active,
            });
        stamp.last_touched = stamp.last_touched.max(ts_ms);
        stamp.state = SlotState::Active;
    }

    pub fn stamp(&self, granularity: Granularity, slot: u32) -> Option<SlotStamp> {
        self.stamps.get(&(granularity, slot)).copied()
    }

    /// Transitions an existing entry; a touch-less slot has no entry and
    /// nothing to transition.
    pub fn set_state(&mut self, granularity: Granularity, slot: u32, state: SlotState) {
        if let Some(stamp) = self.stamps.get_mut(&(granularity, slot)) {
            stamp.state = state;
        }
    }

    /// Iterates the dirty entries: (granularity, slot, last touched).
    pub fn dirty(&self) -> impl Iterator<Item = (Granularity, u32, u64)> + '_ {
        self.stamps
            .iter()
            .filter(|(_, stamp)| stamp.state == SlotState::Active)
            .map(|(&(granularity, slot), stamp)| (granularity, slot, stamp.last_touched))
    }
}
