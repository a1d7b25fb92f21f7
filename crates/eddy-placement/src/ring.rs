//! Consistent hashing ring implementation.

use std::collections::{BTreeMap, HashSet};

use eddy_types::{ShardId, VirtualNode};
use tracing::{debug, warn};

use crate::error::PlacementError;
use crate::hash::{key_hash, vnode_id, vnode_position};
use crate::range::{KeyRange, RedistributionPlan};
use crate::tree::PositionTree;

/// Consistent hashing ring for routing keys to shards.
///
/// Each shard is mapped to several virtual nodes on a u32 ring. A key is owned
/// by the first virtual node at or after its hash, wrapping at the top.
/// Topology changes return the [`RedistributionPlan`] of ranges that changed
/// owner.
#[derive(Debug, Clone)]
pub struct Ring {
    /// Virtual node positions.
    tree: PositionTree,
    /// Virtual nodes actually placed for each shard.
    shards: BTreeMap<ShardId, Vec<VirtualNode>>,
    /// Virtual nodes generated per shard by [`Ring::add_shard`].
    vnodes_per_shard: u16,
}

impl Ring {
    /// Create a new empty ring.
    pub fn new(vnodes_per_shard: u16) -> Self {
        Self {
            tree: PositionTree::new(),
            shards: BTreeMap::new(),
            vnodes_per_shard,
        }
    }

    /// Virtual nodes generated per shard.
    pub fn vnodes_per_shard(&self) -> u16 {
        self.vnodes_per_shard
    }

    /// Generate `count` virtual nodes for a shard without placing them.
    ///
    /// Names are `"<shard>-virtual-<i>"`. A name whose position is already
    /// taken on the ring (or earlier in the batch) is re-hashed as
    /// `"<name>#<n>"` until it lands on a free position.
    pub fn place_vnodes(&self, shard_id: &ShardId, count: u16) -> Vec<VirtualNode> {
        let mut taken = HashSet::with_capacity(usize::from(count));
        (0..count)
            .map(|i| {
                let base = vnode_id(shard_id, i);
                let mut id = base.clone();
                let mut position = vnode_position(&id);
                let mut attempt = 0u32;
                while self.tree.get(position).is_some() || !taken.insert(position) {
                    attempt += 1;
                    id = format!("{base}#{attempt}");
                    position = vnode_position(&id);
                    warn!(%shard_id, vnode = %base, attempt, "ring position collision, re-hashing");
                }
                VirtualNode::new(position, id, shard_id.clone())
            })
            .collect()
    }

    /// Add a shard with `vnodes_per_shard` generated virtual nodes.
    pub fn add_shard(&mut self, shard_id: ShardId) -> Result<RedistributionPlan, PlacementError> {
        let vnodes = self.place_vnodes(&shard_id, self.vnodes_per_shard);
        self.add_shard_with_vnodes(shard_id, vnodes)
    }

    /// Add a shard with explicitly positioned virtual nodes.
    ///
    /// Owners are resolved against the ring as it was before the insert; each
    /// new virtual node takes the arc between its new predecessor and itself.
    /// The plan maps each previous owner to the ranges it gives up. Virtual
    /// nodes whose position is already taken are skipped.
    pub fn add_shard_with_vnodes(
        &mut self,
        shard_id: ShardId,
        vnodes: Vec<VirtualNode>,
    ) -> Result<RedistributionPlan, PlacementError> {
        if self.shards.contains_key(&shard_id) {
            return Err(PlacementError::DuplicateShard(shard_id));
        }

        let mut seen = HashSet::with_capacity(vnodes.len());
        let vnodes: Vec<VirtualNode> = vnodes
            .into_iter()
            .map(|v| VirtualNode {
                shard_id: shard_id.clone(),
                ..v
            })
            .filter(|v| {
                let free = self.tree.get(v.position).is_none() && seen.insert(v.position);
                if !free {
                    warn!(%shard_id, vnode = %v.vnode_id, position = v.position, "skipping vnode on occupied position");
                }
                free
            })
            .collect();

        if vnodes.is_empty() {
            return Err(PlacementError::NoVirtualNodes(shard_id));
        }

        let previous_owners: Vec<Option<ShardId>> = vnodes
            .iter()
            .map(|v| self.tree.successor(v.position).map(|o| o.shard_id.clone()))
            .collect();

        for vnode in &vnodes {
            self.tree.insert(vnode.clone());
        }

        let mut plan = RedistributionPlan::new();
        for (vnode, owner) in vnodes.iter().zip(previous_owners) {
            let Some(owner) = owner else {
                continue;
            };
            debug_assert_ne!(owner, shard_id);
            plan.insert(owner, self.arc_ending_at(vnode.position));
        }

        debug!(%shard_id, vnodes = vnodes.len(), ranges = plan.range_count(), "added shard to ring");
        self.shards.insert(shard_id, vnodes);
        Ok(plan)
    }

    /// Remove a shard from the ring.
    ///
    /// Each of the shard's arcs is measured on the ring before removal and
    /// assigned to the shard that owns its end position afterwards. The plan
    /// maps each inheriting shard to the ranges it receives; it is empty when
    /// the last shard leaves.
    pub fn remove_shard(&mut self, shard_id: &ShardId) -> Result<RedistributionPlan, PlacementError> {
        let vnodes = self
            .shards
            .remove(shard_id)
            .ok_or_else(|| PlacementError::UnknownShard(shard_id.clone()))?;

        let ranges: Vec<KeyRange> = vnodes
            .iter()
            .map(|v| self.arc_ending_at(v.position))
            .collect();

        for vnode in &vnodes {
            if self.tree.delete(vnode).is_none() {
                warn!(%shard_id, vnode = %vnode.vnode_id, "vnode missing from ring during removal");
            }
        }

        let mut plan = RedistributionPlan::new();
        for range in ranges {
            if let Some(heir) = self.tree.successor(range.end) {
                plan.insert(heir.shard_id.clone(), range);
            }
        }

        debug!(%shard_id, ranges = plan.range_count(), "removed shard from ring");
        Ok(plan)
    }

    /// Determine which shard owns a key.
    pub fn owner(&self, key: &str) -> Option<&ShardId> {
        self.owner_of_hash(key_hash(key))
    }

    /// Determine which shard owns a hash position.
    pub fn owner_of_hash(&self, hash: u32) -> Option<&ShardId> {
        self.tree.successor(hash).map(|v| &v.shard_id)
    }

    /// The virtual node owning a hash position.
    pub fn successor(&self, hash: u32) -> Option<&VirtualNode> {
        self.tree.successor(hash)
    }

    /// All virtual nodes in ascending position order.
    pub fn snapshot(&self) -> Vec<VirtualNode> {
        self.tree.iter().cloned().collect()
    }

    /// Virtual nodes placed for a shard.
    pub fn vnodes_of(&self, shard_id: &ShardId) -> Option<&[VirtualNode]> {
        self.shards.get(shard_id).map(Vec::as_slice)
    }

    /// Whether the shard has virtual nodes on the ring.
    pub fn contains_shard(&self, shard_id: &ShardId) -> bool {
        self.shards.contains_key(shard_id)
    }

    /// Fraction of the hash space owned by each shard.
    pub fn ownership(&self) -> BTreeMap<ShardId, f64> {
        let mut spans: BTreeMap<ShardId, u64> = BTreeMap::new();
        for vnode in self.tree.iter() {
            *spans.entry(vnode.shard_id.clone()).or_default() +=
                self.arc_ending_at(vnode.position).span();
        }
        spans
            .into_iter()
            .map(|(shard, span)| (shard, span as f64 / (1u64 << 32) as f64))
            .collect()
    }

    /// Return the number of shards on the ring.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Return the total number of vnodes in the ring.
    pub fn vnode_count(&self) -> usize {
        self.tree.len()
    }

    /// Return all shard IDs on the ring.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().cloned().collect()
    }

    /// The underlying position tree.
    pub fn tree(&self) -> &PositionTree {
        &self.tree
    }

    /// Arc `(predecessor, position]` on the current ring.
    fn arc_ending_at(&self, position: u32) -> KeyRange {
        let start = self
            .tree
            .predecessor(position)
            .map_or(position, |p| p.position);
        KeyRange::new(start, position)
    }
}
