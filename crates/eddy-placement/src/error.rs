//! Error types for placement.

use eddy_types::ShardId;

/// Errors returned by [`Ring`](crate::Ring) topology changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// The shard already has virtual nodes on the ring.
    #[error("shard already on the ring: {0}")]
    DuplicateShard(ShardId),

    /// The shard has no virtual nodes on the ring.
    #[error("shard not on the ring: {0}")]
    UnknownShard(ShardId),

    /// A shard was added with no virtual nodes to place.
    #[error("no virtual nodes to place for shard {0}")]
    NoVirtualNodes(ShardId),
}

/// A broken structural invariant in a [`PositionTree`](crate::PositionTree).
///
/// These are programmer errors; mutations check them with `debug_assert!`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeViolation {
    /// In-order traversal is not strictly ascending.
    #[error("position {position:#010x} is out of order")]
    OutOfOrder {
        /// The misplaced position.
        position: u32,
    },

    /// A node's cached height disagrees with its children.
    #[error("stale height at {position:#010x}: cached {cached}, actual {actual}")]
    StaleHeight {
        /// Position of the node.
        position: u32,
        /// Height stored in the node.
        cached: u32,
        /// Height recomputed from the children.
        actual: u32,
    },

    /// A node's balance factor left `[-1, 1]`.
    #[error("unbalanced at {position:#010x}: balance factor {balance}")]
    Unbalanced {
        /// Position of the node.
        position: u32,
        /// Left height minus right height.
        balance: i64,
    },

    /// The reachable node count disagrees with the tracked length.
    #[error("tree reaches {reachable} nodes but tracks {tracked}")]
    LengthMismatch {
        /// Nodes reachable from the root.
        reachable: usize,
        /// Length recorded by the tree.
        tracked: usize,
    },
}
