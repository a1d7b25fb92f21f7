//! 32-bit fingerprints for keys and virtual nodes.

use eddy_types::ShardId;

/// Compute a key's position on the ring: the first 4 bytes of `blake3(key)`.
pub fn key_hash(key: &str) -> u32 {
    let hash = blake3::hash(key.as_bytes());
    let bytes = hash.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Deterministic name of a shard's `index`-th virtual node.
pub fn vnode_id(shard_id: &ShardId, index: u16) -> String {
    format!("{shard_id}-virtual-{index}")
}

/// Position of a virtual node on the ring.
pub fn vnode_position(vnode_id: &str) -> u32 {
    key_hash(vnode_id)
}
