use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::health::HealthMetrics;
use crate::rollup::RollupWriteContext;
use crate::writer::RollupWriter;

/// Bookkeeping for one dispatch of a slot key: how many rollup writes are
/// outstanding and whether any batch failed.
///
/// The counter and the failure flag are two independent atomics so the
/// common success path never takes a lock; the flag is sticky, flipping
/// false to true exactly once no matter how many tasks report failure.
pub struct RollupExecutionContext {
    outstanding: AtomicU32,
    failed: AtomicBool,
    cause: parking_lot::Mutex<Option<String>>,
}

impl RollupExecutionContext {
    /// Creates a context expecting `expected_writes` rollup writes.
    pub fn new(expected_writes: u32) -> RollupExecutionContext {
        RollupExecutionContext {
            outstanding: AtomicU32::new(expected_writes),
            failed: AtomicBool::new(false),
            cause: parking_lot::Mutex::new(None),
        }
    }

    /// Accounts for `n` completed writes, successful or not. Returns the
    /// number still outstanding; zero means the owning slot key can be
    /// retired or requeued.
    pub fn decrement_write_counter(&self, n: u32) -> u32 {
        let prev = self.outstanding.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "write counter underflow: {prev} - {n}");
        prev.saturating_sub(n)
    }

    pub fn is_done(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }

    /// Sets the sticky failure flag and records the first cause for
    /// diagnostics. Does not touch the counter; the reporting task still
    /// decrements for its batch.
    pub fn mark_unsuccessful(&self, cause: &dyn fmt::Display) {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.cause.lock() = Some(cause.to_string());
        }
    }

    /// True only if no batch ever reported a failure.
    pub fn was_successful(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
    }

    /// First recorded failure cause, if any.
    pub fn failure_cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }
}

/// Performs one storage write covering a whole batch of rollups and
/// reports the outcome to the shared execution context.
///
/// Failures never propagate to the caller: they become state on the
/// execution context, and the counter is decremented either way so the
/// slot key can not get stuck in the running set.
pub async fn write_rollup_batch<W: RollupWriter>(
    writer: &W,
    batch: &[RollupWriteContext],
    exec: &RollupExecutionContext,
    health: &HealthMetrics,
) {
    let timer = health.batch_write_duration.start_timer();

    match writer.insert_rollups(batch).await {
        Ok(()) => {
            health.last_rollup_time.set(unix_seconds());
            debug!(writer = writer.name(), batch = batch.len(), "rollup batch written");
        }
        Err(e) => {
            warn!(
                writer = writer.name(),
                batch = batch.len(),
                error = %e,
                "rollup batch write failed",
            );
            exec.mark_unsuccessful(&e);
        }
    }

    exec.decrement_write_counter(batch.len() as u32);
    health.rollup_batch_size.observe(batch.len() as f64);
    timer.observe_duration();
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
