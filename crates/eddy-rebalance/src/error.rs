//! Error types for key migration.

use eddy_store::StoreError;
use eddy_types::ShardId;

/// Errors that abort a single migration task.
///
/// Individual pipeline commands that fail are counted in the
/// [`MigrationReport`](crate::MigrationReport) instead.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Scanning or fetching from a shard's store failed.
    #[error("store error on {shard}: {source}")]
    Store {
        /// Shard whose store failed.
        shard: ShardId,
        /// Underlying store error.
        source: StoreError,
    },
}

impl MigrationError {
    pub(crate) fn store(shard: &ShardId) -> impl FnOnce(StoreError) -> Self + '_ {
        move |source| Self::Store {
            shard: shard.clone(),
            source,
        }
    }
}
