//! Error types for the cluster crate.

use eddy_placement::PlacementError;
use eddy_types::ShardId;

/// Errors produced by topology changes.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A join named a shard that is already registered.
    #[error("shard already registered: {0}")]
    AlreadyRegistered(ShardId),

    /// A leave named a shard that is not registered.
    #[error("shard not registered: {0}")]
    UnknownShard(ShardId),

    /// The ring rejected the change.
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),
}
