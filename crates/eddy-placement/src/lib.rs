//! Consistent hashing ring for routing keys to shards.
//!
//! This crate implements the placement side of eddy: a 32-bit hash ring whose
//! virtual-node positions live in an AVL tree ([`PositionTree`]), and a
//! [`Ring`] that maps keys to physical shards and computes which key ranges
//! change owner when a shard joins or leaves.
//!
//! Each physical shard gets several positions on the ring, determined by
//! hashing `"<shard>-virtual-<i>"`. A key belongs to the first virtual node at
//! or after its own hash, wrapping at the top of the space.

mod error;
mod hash;
mod range;
mod ring;
mod tree;

pub use error::{PlacementError, TreeViolation};
pub use hash::{key_hash, vnode_id, vnode_position};
pub use range::{KeyRange, RedistributionPlan};
pub use ring::Ring;
pub use tree::{Iter, PositionTree};
