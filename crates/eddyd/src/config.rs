//! TOML configuration for the eddy daemon.
//!
//! Every section is optional; missing values fall back to the library
//! defaults (`eddy_types`).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use eddy_types::{
    DEFAULT_PROBE_INTERVAL_MS, DEFAULT_SHARD_COUNT, DEFAULT_VNODES_PER_SHARD, MembershipConfig,
    MigrationConfig, PING_FAILURE_THRESHOLD, RingConfig, SCAN_BATCH_SIZE, ShardId, shard_id_for,
};
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Ring shape and routing.
    pub ring: RingSection,
    /// Health probing.
    pub membership: MembershipSection,
    /// Key migration tuning.
    pub migration: MigrationSection,
    /// In-process shard stores.
    pub store: StoreSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[ring]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RingSection {
    /// Virtual nodes per shard.
    pub vnodes_per_shard: Option<u16>,
    /// Number of `cache-node-<i>` shards created at start-up.
    pub shard_count: Option<u16>,
    /// Explicit shard names. Overrides `shard_count` when non-empty.
    pub shards: Vec<String>,
    /// Log every routing decision at `info`.
    pub verbose_routing: bool,
}

/// `[membership]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MembershipSection {
    /// Milliseconds between probe rounds.
    pub probe_interval_ms: Option<u64>,
    /// Consecutive failed probes before eviction.
    pub failure_threshold: Option<u32>,
    /// Re-admit evicted shards once they answer again.
    pub rejoin_on_recovery: bool,
}

/// `[migration]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MigrationSection {
    /// Keys requested per scan round.
    pub batch_size: Option<usize>,
}

/// `[store]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// `[min, max]` read latency in milliseconds.
    pub read_latency_ms: Option<[u64; 2]>,
    /// `[min, max]` write latency in milliseconds.
    pub write_latency_ms: Option<[u64; 2]>,
    /// Seed for the latency RNG.
    pub seed: Option<u64>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                config.validate()?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let config: CliConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.vnodes_per_shard() > 0, "ring.vnodes_per_shard must be positive");
        anyhow::ensure!(self.failure_threshold() > 0, "membership.failure_threshold must be positive");
        anyhow::ensure!(
            self.probe_interval() > Duration::ZERO,
            "membership.probe_interval_ms must be positive"
        );
        anyhow::ensure!(self.batch_size() > 0, "migration.batch_size must be positive");
        Ok(())
    }

    /// Effective virtual nodes per shard.
    pub fn vnodes_per_shard(&self) -> u16 {
        self.ring.vnodes_per_shard.unwrap_or(DEFAULT_VNODES_PER_SHARD)
    }

    /// Shards created at start-up.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        if self.ring.shards.is_empty() {
            let count = self.ring.shard_count.unwrap_or(DEFAULT_SHARD_COUNT);
            (0..count).map(shard_id_for).collect()
        } else {
            self.ring.shards.iter().map(|s| ShardId::from(s.as_str())).collect()
        }
    }

    /// Effective probe interval.
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(
            self.membership
                .probe_interval_ms
                .unwrap_or(DEFAULT_PROBE_INTERVAL_MS),
        )
    }

    /// Effective failure threshold.
    pub fn failure_threshold(&self) -> u32 {
        self.membership
            .failure_threshold
            .unwrap_or(PING_FAILURE_THRESHOLD)
    }

    /// Effective scan batch size.
    pub fn batch_size(&self) -> usize {
        self.migration.batch_size.unwrap_or(SCAN_BATCH_SIZE)
    }

    pub fn ring_config(&self) -> RingConfig {
        RingConfig {
            vnodes_per_shard: self.vnodes_per_shard(),
            shard_count: u16::try_from(self.shard_ids().len()).unwrap_or(u16::MAX),
            verbose_routing: self.ring.verbose_routing,
        }
    }

    pub fn membership_config(&self) -> MembershipConfig {
        MembershipConfig {
            probe_interval: self.probe_interval(),
            failure_threshold: self.failure_threshold(),
            rejoin_on_recovery: self.membership.rejoin_on_recovery,
        }
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            batch_size: self.batch_size(),
        }
    }
}
