pub mod clickhouse;

use std::future::Future;

use crate::rollup::RollupWriteContext;

/// Storage write failure taxonomy.
///
/// `Connectivity` covers transient transport loss and is the signal that a
/// slot key should be requeued; `Rejected` covers the backend refusing the
/// batch, which is also retried because the write may succeed after an
/// operator fixes the schema or quota.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("storage connectivity: {0}")]
    Connectivity(String),
    #[error("storage rejected batch: {0}")]
    Rejected(String),
}

/// Persists batches of computed rollups.
///
/// The scheduling engine depends only on this signature; implementations
/// own the wire protocol and connection management.
pub trait RollupWriter: Send + Sync {
    /// Returns the writer's name for logging.
    fn name(&self) -> &str;

    /// Performs one storage write covering the whole batch.
    fn insert_rollups(
        &self,
        batch: &[RollupWriteContext],
    ) -> impl Future<Output = Result<(), WriteError>> + Send;
}
