pub mod state;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::rollup::{Granularity, SlotKey};

use self::state::{SlotState, SlotStateTable};

/// State-machine contract violation; reported immediately, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("slot key {0} is not in the running set")]
    NotRunning(SlotKey),
    #[error("shard {0} is not managed by this context")]
    UnmanagedShard(u32),
}

/// Outcome of one eligibility pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulePass {
    /// Dirty slots promoted into the scheduled queues.
    pub promoted: usize,
    /// Dirty slots older than the max age, dropped from consideration.
    pub dropped: usize,
}

/// Everything mutable for one shard, guarded by a single mutex so the
/// exclusivity check observes scheduled and running as one snapshot.
#[derive(Debug, Default)]
struct ShardSchedule {
    slots: SlotStateTable,
    /// Scheduled keys in dispatch order, oldest slot first.
    queue: VecDeque<SlotKey>,
    /// Membership set mirroring `queue`.
    scheduled: HashSet<SlotKey>,
    running: HashSet<SlotKey>,
}

impl ShardSchedule {
    fn in_flight(&self, key: &SlotKey) -> bool {
        self.scheduled.contains(key) || self.running.contains(key)
    }

    /// True if any strictly finer slot under `key` is scheduled or running.
    fn any_descendant_in_flight(&self, key: SlotKey) -> bool {
        for finer in key.granularity.descendants() {
            for child in key.covered_by(finer) {
                if self.in_flight(&child) {
                    return true;
                }
            }
        }
        false
    }
}

/// The rollup scheduling state machine.
///
/// Tracks, per managed shard, which slots are dirty, scheduled, or running,
/// and moves each slot key through
/// `dirty -> scheduled -> running -> (rolled | dirty again)`.
/// Each shard's state sits behind its own mutex; operations on different
/// shards never contend.
pub struct ScheduleContext {
    /// Managed shard ids, fixed at construction. Dispatch round-robins
    /// over this order.
    shards: Vec<u32>,
    states: HashMap<u32, Mutex<ShardSchedule>>,
    /// Scheduling clock in unix milliseconds, advanced by the driver loop.
    current_time_ms: AtomicU64,
    cursor: AtomicUsize,
    scheduled_count: AtomicUsize,
    running_count: AtomicUsize,
    dropped_count: AtomicU64,
}

impl ScheduleContext {
    pub fn new(current_time_ms: u64, managed_shards: &[u32]) -> ScheduleContext {
        let shards: Vec<u32> = managed_shards.to_vec();
        let states = shards
            .iter()
            .map(|&shard| (shard, Mutex::new(ShardSchedule::default())))
            .collect();

        ScheduleContext {
            shards,
            states,
            current_time_ms: AtomicU64::new(current_time_ms),
            cursor: AtomicUsize::new(0),
            scheduled_count: AtomicUsize::new(0),
            running_count: AtomicUsize::new(0),
            dropped_count: AtomicU64::new(0),
        }
    }

    /// Advances the scheduling clock; never moves it backwards.
    pub fn set_current_time(&self, ts_ms: u64) {
        self.current_time_ms.fetch_max(ts_ms, Ordering::Relaxed);
    }

    pub fn current_time(&self) -> u64 {
        self.current_time_ms.load(Ordering::Relaxed)
    }

    /// Marks the finest-granularity slot containing `ts_ms` dirty for
    /// `shard`. Idempotent; never moves an already scheduled or running
    /// slot, it only re-activates the state-table entry.
    pub fn update(&self, ts_ms: u64, shard: u32) {
        let Some(state) = self.states.get(&shard) else {
            warn!(shard, "update for unmanaged shard ignored");
            return;
        };

        let granularity = Granularity::finest();
        let slot = granularity.slot(ts_ms);
        state.lock().slots.touch(granularity, slot, ts_ms);
    }

    /// Promotes eligible dirty slots into the scheduled queues.
    ///
    /// A dirty slot is eligible once its last-touched timestamp is older
    /// than `lag_ms` (late data has settled) and younger than `max_age_ms`
    /// (older slots are tail-dropped to bound the backlog). A slot at a
    /// coarser granularity is held back while any finer slot under it is
    /// still scheduled or running, so a parent never rolls up a window
    /// whose children are mid-update.
    pub fn schedule_eligible_slots(&self, lag_ms: u64, max_age_ms: u64) -> SchedulePass {
        let now = self.current_time();
        let mut pass = SchedulePass::default();

        for &shard in &self.shards {
            let mut guard = self.states[&shard].lock();

            let mut eligible: Vec<(Granularity, u32, u64)> = Vec::new();
            let mut stale: Vec<(Granularity, u32)> = Vec::new();
            for (granularity, slot, touched) in guard.slots.dirty() {
                let age = now.saturating_sub(touched);
                if age > max_age_ms {
                    stale.push((granularity, slot));
                } else if age > lag_ms {
                    eligible.push((granularity, slot, touched));
                }
            }

            for (granularity, slot) in stale {
                guard.slots.set_state(granularity, slot, SlotState::Rolled);
                debug!(%granularity, slot, shard, "dropping slot older than max age");
                pass.dropped += 1;
            }

            // Finer granularities first so a parent eligible in the same
            // pass sees its child already promoted and holds back; within
            // a granularity, oldest windows first for bounded staleness.
            eligible.sort_by_key(|&(granularity, slot, _)| (granularity, slot));

            let mut promoted = 0;
            for (granularity, slot, _) in eligible {
                let key = SlotKey::new(granularity, slot, shard);
                if guard.in_flight(&key) {
                    continue;
                }
                if !granularity.is_finest() && guard.any_descendant_in_flight(key) {
                    continue;
                }
                guard.slots.set_state(granularity, slot, SlotState::Running);
                guard.scheduled.insert(key);
                guard.queue.push_back(key);
                promoted += 1;
            }
            // Counted while still holding the shard's guard, so a pop on
            // another thread can never decrement ahead of this increment
            // and wrap the counter.
            self.scheduled_count.fetch_add(promoted, Ordering::Relaxed);
            pass.promoted += promoted;
        }

        self.dropped_count.fetch_add(pass.dropped as u64, Ordering::Relaxed);
        pass
    }

    /// Pops the oldest scheduled key from some shard into that shard's
    /// running set. Shards are visited round-robin so no shard starves.
    pub fn get_next_scheduled(&self) -> Option<SlotKey> {
        if self.shards.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.shards.len() {
            let shard = self.shards[(start + offset) % self.shards.len()];
            let mut guard = self.states[&shard].lock();
            if let Some(key) = guard.queue.pop_front() {
                guard.scheduled.remove(&key);
                guard.running.insert(key);
                self.scheduled_count.fetch_sub(1, Ordering::Relaxed);
                self.running_count.fetch_add(1, Ordering::Relaxed);
                return Some(key);
            }
        }
        None
    }

    /// Removes a key from the running set after all its writes completed,
    /// regardless of outcome.
    ///
    /// Retires the state-table entry only if it was not re-touched while
    /// running; data that arrived mid-flight leaves the slot dirty for the
    /// next pass. The covering parent slot is marked dirty so coarser
    /// rollups chain upward.
    pub fn clear_from_running(&self, key: SlotKey) -> Result<(), ScheduleError> {
        let state = self
            .states
            .get(&key.shard)
            .ok_or(ScheduleError::UnmanagedShard(key.shard))?;
        let mut guard = state.lock();

        if !guard.running.remove(&key) {
            return Err(ScheduleError::NotRunning(key));
        }
        self.running_count.fetch_sub(1, Ordering::Relaxed);

        if let Some(stamp) = guard.slots.stamp(key.granularity, key.slot) {
            if stamp.state == SlotState::Running {
                guard
                    .slots
                    .set_state(key.granularity, key.slot, SlotState::Rolled);
            }
            if let Ok(parent) = key.parent() {
                guard
                    .slots
                    .touch(parent.granularity, parent.slot, stamp.last_touched);
            }
        }

        Ok(())
    }

    /// Re-queues a key whose execution failed or was only partially
    /// successful. `reschedule_immediately` puts it at the front of the
    /// shard's queue, otherwise it goes to the back behind older work.
    /// The work is never dropped.
    pub fn push_back_to_scheduled(
        &self,
        key: SlotKey,
        reschedule_immediately: bool,
    ) -> Result<(), ScheduleError> {
        let state = self
            .states
            .get(&key.shard)
            .ok_or(ScheduleError::UnmanagedShard(key.shard))?;
        let mut guard = state.lock();

        if guard.scheduled.contains(&key) {
            return Ok(());
        }

        guard.slots.set_state(key.granularity, key.slot, SlotState::Running);
        guard.scheduled.insert(key);
        if reschedule_immediately {
            guard.queue.push_front(key);
        } else {
            guard.queue.push_back(key);
        }
        self.scheduled_count.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// True if the key itself, or any finer-granularity slot whose parent
    /// chain reaches it, is currently scheduled or running.
    ///
    /// This is the guard that keeps a coarser rollup from computing over a
    /// child window still in flight. The whole check runs under the
    /// shard's lock, so it sees one consistent snapshot of both sets.
    pub fn are_child_keys_or_self_key_scheduled_or_running(&self, key: SlotKey) -> bool {
        let Some(state) = self.states.get(&key.shard) else {
            return false;
        };
        let guard = state.lock();
        guard.in_flight(&key) || guard.any_descendant_in_flight(key)
    }

    /// Scheduled keys across all shards.
    pub fn get_scheduled_count(&self) -> usize {
        self.scheduled_count.load(Ordering::Relaxed)
    }

    /// Running keys across all shards.
    pub fn get_running_count(&self) -> usize {
        self.running_count.load(Ordering::Relaxed)
    }

    /// Slots tail-dropped for exceeding the max age, cumulative.
    pub fn get_dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn managed_shards(&self) -> &[u32] {
        &self.shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURRENT_TIME: u64 = 1_234_000;
    const SHARD: u32 = 0;

    fn context() -> (ScheduleContext, SlotKey) {
        let ctx = ScheduleContext::new(CURRENT_TIME, &[SHARD]);
        let slot = Granularity::Min5.slot(CURRENT_TIME);
        (ctx, SlotKey::new(Granularity::Min5, slot, SHARD))
    }

    #[test]
    fn test_none_scheduled_or_running_returns_false() {
        let (ctx, key) = context();

        assert_eq!(ctx.get_scheduled_count(), 0);
        assert_eq!(ctx.get_running_count(), 0);
        assert!(!ctx.are_child_keys_or_self_key_scheduled_or_running(key));
    }

    #[test]
    fn test_eligible_slot_is_scheduled_once() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);

        let pass = ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(pass, SchedulePass { promoted: 1, dropped: 0 });
        assert_eq!(ctx.get_scheduled_count(), 1);
        assert_eq!(ctx.get_running_count(), 0);
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(key));

        // Idempotent under repeated scheduling calls.
        let pass = ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(pass.promoted, 0);
        assert_eq!(ctx.get_scheduled_count(), 1);
    }

    #[test]
    fn test_slot_within_lag_window_is_not_scheduled() {
        let (ctx, _) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);

        let pass = ctx.schedule_eligible_slots(10, 7_200_000);
        assert_eq!(pass.promoted, 0);
        assert_eq!(ctx.get_scheduled_count(), 0);
    }

    #[test]
    fn test_slot_older_than_max_age_is_dropped() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 100_000, SHARD);

        let pass = ctx.schedule_eligible_slots(1, 50_000);
        assert_eq!(pass, SchedulePass { promoted: 0, dropped: 1 });
        assert_eq!(ctx.get_scheduled_count(), 0);
        assert_eq!(ctx.get_dropped_count(), 1);
        assert!(!ctx.are_child_keys_or_self_key_scheduled_or_running(key));

        // The drop is terminal for this occurrence.
        let pass = ctx.schedule_eligible_slots(1, 50_000);
        assert_eq!(pass, SchedulePass::default());
    }

    #[test]
    fn test_unrelated_slot_is_not_reported() {
        let (ctx, _) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);

        // The previous 5-minute window, same shard.
        let other_slot = Granularity::Min5.slot(CURRENT_TIME - 5 * 60 * 1000);
        let other = SlotKey::new(Granularity::Min5, other_slot, SHARD);
        assert!(!ctx.are_child_keys_or_self_key_scheduled_or_running(other));
    }

    #[test]
    fn test_parent_key_sees_scheduled_child() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);

        let parent = key.parent().expect("finest has parent");
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(parent));

        let coarsest = SlotKey::new(
            Granularity::Min1440,
            Granularity::Min1440.slot(CURRENT_TIME),
            SHARD,
        );
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(coarsest));
    }

    #[test]
    fn test_get_next_scheduled_moves_key_to_running() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);

        let running = ctx.get_next_scheduled().expect("one key scheduled");
        assert_eq!(running, key);
        assert_eq!(ctx.get_scheduled_count(), 0);
        assert_eq!(ctx.get_running_count(), 1);
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(key));

        assert_eq!(ctx.get_next_scheduled(), None);
    }

    #[test]
    fn test_parent_key_sees_running_child() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);
        ctx.get_next_scheduled().expect("one key scheduled");

        let parent = key.parent().expect("finest has parent");
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(parent));
    }

    #[test]
    fn test_push_back_returns_key_to_scheduled() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);

        let running = ctx.get_next_scheduled().expect("one key scheduled");
        ctx.clear_from_running(running).expect("key was running");
        ctx.push_back_to_scheduled(running, false)
            .expect("managed shard");

        assert_eq!(ctx.get_scheduled_count(), 1);
        assert_eq!(ctx.get_running_count(), 0);
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(key));

        let parent = key.parent().expect("finest has parent");
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(parent));
    }

    #[test]
    fn test_push_back_immediately_goes_first() {
        let ctx = ScheduleContext::new(CURRENT_TIME, &[SHARD]);
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.update(CURRENT_TIME - 5 * 60 * 1000, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(ctx.get_scheduled_count(), 2);

        // Oldest window first.
        let older = ctx.get_next_scheduled().expect("scheduled");
        let newer = ctx.get_next_scheduled().expect("scheduled");
        assert!(older.slot < newer.slot);

        ctx.clear_from_running(newer).expect("running");
        ctx.clear_from_running(older).expect("running");
        ctx.push_back_to_scheduled(newer, false).expect("managed");
        ctx.push_back_to_scheduled(older, true).expect("managed");

        assert_eq!(ctx.get_next_scheduled(), Some(older));
        assert_eq!(ctx.get_next_scheduled(), Some(newer));
    }

    #[test]
    fn test_clear_from_running_cascades_parent_dirty() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);
        let running = ctx.get_next_scheduled().expect("scheduled");
        ctx.clear_from_running(running).expect("running");

        // The child retired, so the parent becomes eligible.
        let pass = ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(pass.promoted, 1);

        let parent = key.parent().expect("finest has parent");
        let next = ctx.get_next_scheduled().expect("parent scheduled");
        assert_eq!(next, parent);
    }

    #[test]
    fn test_parent_held_back_while_child_in_flight() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);
        let running = ctx.get_next_scheduled().expect("scheduled");

        // Failure path: child goes back to scheduled, parent already dirty.
        ctx.clear_from_running(running).expect("running");
        ctx.push_back_to_scheduled(running, false).expect("managed");

        let pass = ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(pass.promoted, 0, "parent must wait for the child");
        assert_eq!(ctx.get_next_scheduled(), Some(key));

        // Child retires for real; now the parent goes.
        ctx.clear_from_running(key).expect("running");
        let pass = ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(pass.promoted, 1);
        assert_eq!(
            ctx.get_next_scheduled(),
            Some(key.parent().expect("finest has parent")),
        );
    }

    #[test]
    fn test_update_while_running_keeps_slot_dirty() {
        let (ctx, key) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);
        let running = ctx.get_next_scheduled().expect("scheduled");

        // Late data lands mid-flight, old enough to clear the lag window.
        ctx.update(CURRENT_TIME - 5, SHARD);
        ctx.clear_from_running(running).expect("running");

        // The slot is re-promoted instead of retiring.
        let pass = ctx.schedule_eligible_slots(1, 7_200_000);
        assert!(pass.promoted >= 1);
        assert!(ctx.are_child_keys_or_self_key_scheduled_or_running(key));
    }

    #[test]
    fn test_double_clear_is_a_contract_violation() {
        let (ctx, _) = context();
        ctx.update(CURRENT_TIME - 2, SHARD);
        ctx.schedule_eligible_slots(1, 7_200_000);
        let running = ctx.get_next_scheduled().expect("scheduled");

        ctx.clear_from_running(running).expect("running");
        assert_eq!(
            ctx.clear_from_running(running),
            Err(ScheduleError::NotRunning(running)),
        );
    }

    #[test]
    fn test_unmanaged_shard_is_rejected() {
        let (ctx, _) = context();
        let foreign = SlotKey::new(Granularity::Min5, 0, 99);
        assert_eq!(
            ctx.clear_from_running(foreign),
            Err(ScheduleError::UnmanagedShard(99)),
        );
        assert_eq!(
            ctx.push_back_to_scheduled(foreign, false),
            Err(ScheduleError::UnmanagedShard(99)),
        );
        assert!(!ctx.are_child_keys_or_self_key_scheduled_or_running(foreign));
    }

    #[test]
    fn test_round_robin_across_shards() {
        let ctx = ScheduleContext::new(CURRENT_TIME, &[0, 1]);
        ctx.update(CURRENT_TIME - 2, 0);
        ctx.update(CURRENT_TIME - 2, 1);
        ctx.schedule_eligible_slots(1, 7_200_000);
        assert_eq!(ctx.get_scheduled_count(), 2);

        let first = ctx.get_next_scheduled().expect("scheduled");
        let second = ctx.get_next_scheduled().expect("scheduled");
        assert_ne!(first.shard, second.shard);
        assert_eq!(ctx.get_next_scheduled(), None);
        assert_eq!(ctx.get_running_count(), 2);
    }

    #[test]
    fn test_concurrent_update_and_schedule() {
        use std::sync::Arc;
        use std::thread;

        let ctx = Arc::new(ScheduleContext::new(CURRENT_TIME, &[0, 1, 2, 3]));
        let mut handles = Vec::new();

        for shard in 0..4u32 {
            let ctx = Arc::clone(&ctx);
            handles.push(thread::spawn(move || {
                for i in 0..1_000u64 {
                    ctx.update(CURRENT_TIME - 2 - (i % 7), shard);
                }
            }));
        }
        for _ in 0..2 {
            let ctx = Arc::clone(&ctx);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    ctx.schedule_eligible_slots(1, 7_200_000);
                    while let Some(key) = ctx.get_next_scheduled() {
                        ctx.clear_from_running(key).expect("popped key is running");
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().expect("thread panicked");
        }

        // Drain whatever the racing schedulers left behind.
        ctx.schedule_eligible_slots(1, 7_200_000);
        while let Some(key) = ctx.get_next_scheduled() {
            ctx.clear_from_running(key).expect("popped key is running");
        }
        assert_eq!(ctx.get_running_count(), 0);
        assert_eq!(ctx.get_scheduled_count(), 0);
    }

    #[test]
    fn test_scheduled_count_stays_bounded_while_promote_races_pop() {
        use std::sync::Arc;
        use std::thread;

        // Clock far enough forward that eight 5-minute windows of offsets
        // below it stay non-negative.
        let base = CURRENT_TIME + 8 * 5 * 60 * 1000;
        let ctx = Arc::new(ScheduleContext::new(base, &[SHARD]));

        let promoter = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                for _ in 0..500 {
                    for i in 0..8u64 {
                        ctx.update(base - 2 - i * 5 * 60 * 1000, SHARD);
                    }
                    ctx.schedule_eligible_slots(1, 7_200_000);
                }
            })
        };
        let popper = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || {
                for _ in 0..500 {
                    while let Some(key) = ctx.get_next_scheduled() {
                        ctx.clear_from_running(key).expect("popped key is running");
                        // A pop racing the promotion pass must never show
                        // the counter wrapped below zero.
                        assert!(ctx.get_scheduled_count() < 100_000);
                    }
                }
            })
        };

        promoter.join().expect("promoter panicked");
        popper.join().expect("popper panicked");
    }
}
