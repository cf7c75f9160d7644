pub mod granularity;
pub mod key;
pub mod store;
pub mod value;

use std::sync::Arc;

pub use granularity::{Granularity, InvalidGranularity};
pub use key::SlotKey;
pub use value::Rollup;

/// One computed rollup value plus its destination coordinates.
///
/// Immutable once created; grouped into batches purely for write
/// efficiency, with no dependency between members of a batch.
#[derive(Debug, Clone)]
pub struct RollupWriteContext {
    /// Metric identity the rollup belongs to.
    pub locator: Arc<str>,
    /// Destination slot (granularity, slot index, shard).
    pub key: SlotKey,
    /// Wall-clock start of the slot's window, unix milliseconds.
    pub window_start_ms: u64,
    pub rollup: Rollup,
}
