//! Shared types and identifiers for eddy.
//!
//! This crate defines the types used across the eddy workspace:
//! identifiers ([`ShardId`]), the ring data model ([`VirtualNode`],
//! [`ShardState`], [`ShardStatus`]), topology events ([`RingEvent`]),
//! and tuning ([`RingConfig`], [`MembershipConfig`], [`MigrationConfig`]).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Virtual nodes placed on the ring for every physical shard.
pub const DEFAULT_VNODES_PER_SHARD: u16 = 5;

/// Physical shards created by the bootstrap layer when none are configured.
pub const DEFAULT_SHARD_COUNT: u16 = 3;

/// Consecutive failed probes before a shard is evicted from the ring.
pub const PING_FAILURE_THRESHOLD: u32 = 3;

/// Interval between health-probe rounds, in milliseconds.
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;

/// Keys requested per `SCAN` round during migration.
pub const SCAN_BATCH_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of a physical shard (one backing key-value store).
#[derive(Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ShardId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", self.0)
    }
}

/// Name of the `index`-th statically configured shard: `cache-node-<index>`.
pub fn shard_id_for(index: u16) -> ShardId {
    ShardId(format!("cache-node-{index}"))
}

// ---------------------------------------------------------------------------
// Ring data model
// ---------------------------------------------------------------------------

/// One of the positions a physical shard occupies on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualNode {
    /// 32-bit fingerprint of `vnode_id`; the ordering key on the ring.
    pub position: u32,
    /// Deterministic name, `"<shard>-virtual-<i>"`.
    pub vnode_id: String,
    /// The physical shard this virtual node belongs to.
    pub shard_id: ShardId,
}

impl VirtualNode {
    /// Build a virtual node at an explicit position.
    pub fn new(position: u32, vnode_id: impl Into<String>, shard_id: ShardId) -> Self {
        Self {
            position,
            vnode_id: vnode_id.into(),
            shard_id,
        }
    }
}

/// Health state of a registered shard, driven by the membership probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardState {
    /// The shard answers probes and serves its ring ranges.
    Active,
    /// The shard crossed the failure threshold and is being evicted.
    Inactive,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardState::Active => f.write_str("active"),
            ShardState::Inactive => f.write_str("inactive"),
        }
    }
}

/// Read-only view of a registered shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatus {
    /// The shard's identifier.
    pub shard_id: ShardId,
    /// Current health state.
    pub state: ShardState,
    /// Consecutive failed probes since the last success.
    pub ping_failures: u32,
    /// Virtual nodes the shard holds on the ring.
    pub vnode_count: usize,
}

/// Topology events broadcast by the ring manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingEvent {
    /// A shard finished joining and is now routable.
    ShardJoined(ShardId),
    /// A shard's virtual nodes were removed and it was deregistered.
    ShardLeft(ShardId),
    /// The membership probe declared a shard inactive and started its removal.
    ShardEvicted(ShardId),
    /// One migration task finished.
    MigrationCompleted {
        /// Shard keys were moved from.
        from: ShardId,
        /// Shard keys were moved to.
        to: ShardId,
        /// Keys written to `to`.
        keys: u64,
    },
    /// One migration task aborted; keys already moved stay moved.
    MigrationFailed {
        /// Shard keys were moved from.
        from: ShardId,
        /// Shard keys were moved to.
        to: ShardId,
        /// Human-readable failure cause.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Ring shape and routing behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    /// Virtual nodes generated per physical shard.
    pub vnodes_per_shard: u16,
    /// Physical shards created at start-up.
    pub shard_count: u16,
    /// Log every routing decision at `info` instead of `debug`.
    pub verbose_routing: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            vnodes_per_shard: DEFAULT_VNODES_PER_SHARD,
            shard_count: DEFAULT_SHARD_COUNT,
            verbose_routing: false,
        }
    }
}

/// Health-probe tuning for the membership controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    /// Interval between probe rounds.
    pub probe_interval: Duration,
    /// Consecutive failures before a shard is evicted.
    pub failure_threshold: u32,
    /// Re-admit an evicted shard through `join` once it answers a probe again.
    pub rejoin_on_recovery: bool,
}

impl MembershipConfig {
    /// Create a config suitable for fast test execution.
    pub fn test_config() -> Self {
        Self {
            probe_interval: Duration::from_millis(20),
            failure_threshold: PING_FAILURE_THRESHOLD,
            rejoin_on_recovery: false,
        }
    }

    /// Create a default config for production use.
    pub fn default_config() -> Self {
        Self {
            probe_interval: Duration::from_millis(DEFAULT_PROBE_INTERVAL_MS),
            failure_threshold: PING_FAILURE_THRESHOLD,
            rejoin_on_recovery: false,
        }
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

/// Migration engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Keys requested per `SCAN` round.
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: SCAN_BATCH_SIZE,
        }
    }
}
