//! Ring arcs and the per-shard redistribution plan built on topology changes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use eddy_types::ShardId;

/// Size of the 32-bit hash space.
const RING_SIZE: u64 = 1 << 32;

/// A clockwise arc of the ring, `(start, end]`, that may wrap past `u32::MAX`.
///
/// `end` is the position of the virtual node owning the arc and `start` the
/// position of its predecessor. When `start == end` the arc covers the whole
/// ring (a ring with a single virtual node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    /// Exclusive lower bound (the predecessor's position).
    pub start: u32,
    /// Inclusive upper bound (the owning virtual node's position).
    pub end: u32,
}

impl KeyRange {
    /// Create the arc `(start, end]`.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Whether `hash` falls inside the arc.
    pub fn contains(&self, hash: u32) -> bool {
        match self.start.cmp(&self.end) {
            Ordering::Less => hash > self.start && hash <= self.end,
            Ordering::Greater => hash > self.start || hash <= self.end,
            Ordering::Equal => true,
        }
    }

    /// Number of hash values covered by the arc.
    pub fn span(&self) -> u64 {
        match self.start.cmp(&self.end) {
            Ordering::Less => u64::from(self.end - self.start),
            Ordering::Greater => RING_SIZE - u64::from(self.start) + u64::from(self.end),
            Ordering::Equal => RING_SIZE,
        }
    }

    /// Whether the arc crosses the top of the hash space.
    pub fn wraps(&self) -> bool {
        self.start >= self.end
    }
}

impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.end
            .cmp(&other.end)
            .then_with(|| self.start.cmp(&other.start))
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#010x}, {:#010x}]", self.start, self.end)
    }
}

/// Key ranges that change owner in one join or leave, grouped by the other
/// shard involved.
///
/// For a join the key is the shard that currently owns the ranges (the
/// migration source); for a leave it is the shard that inherits them (the
/// migration target). Ranges are ordered by the position of the virtual node
/// that ends them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedistributionPlan {
    moves: BTreeMap<ShardId, BTreeSet<KeyRange>>,
}

impl RedistributionPlan {
    /// Create an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `range` moves to or from `shard_id`.
    pub fn insert(&mut self, shard_id: ShardId, range: KeyRange) {
        self.moves.entry(shard_id).or_default().insert(range);
    }

    /// Whether no ranges change owner.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Number of distinct shards involved.
    pub fn shard_count(&self) -> usize {
        self.moves.len()
    }

    /// Total number of ranges across all shards.
    pub fn range_count(&self) -> usize {
        self.moves.values().map(BTreeSet::len).sum()
    }

    /// Ranges recorded for one shard.
    pub fn ranges_for(&self, shard_id: &ShardId) -> Option<&BTreeSet<KeyRange>> {
        self.moves.get(shard_id)
    }

    /// Positions (range ends) recorded for one shard.
    pub fn positions_for(&self, shard_id: &ShardId) -> Vec<u32> {
        self.moves
            .get(shard_id)
            .map(|ranges| ranges.iter().map(|r| r.end).collect())
            .unwrap_or_default()
    }

    /// Iterate `(shard, ranges)` in shard order.
    pub fn iter(&self) -> impl Iterator<Item = (&ShardId, &BTreeSet<KeyRange>)> {
        self.moves.iter()
    }

    /// Whether `hash` falls in any recorded range.
    pub fn covers(&self, hash: u32) -> bool {
        self.moves
            .values()
            .any(|ranges| ranges.iter().any(|r| r.contains(hash)))
    }
}

impl IntoIterator for RedistributionPlan {
    type Item = (ShardId, BTreeSet<KeyRange>);
    type IntoIter = std::collections::btree_map::IntoIter<ShardId, BTreeSet<KeyRange>>;

    fn into_iter(self) -> Self::IntoIter {
        self.moves.into_iter()
    }
}
