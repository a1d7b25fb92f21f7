//! In-process shard stores for the daemon.
//!
//! Every shard is a [`MemoryStore`] behind a [`FlakyStore`], so diagnostics
//! can inject latency and failures without a real key-value server.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use eddy_cluster::RingManager;
use eddy_store::{FlakyStore, KvStore, MemoryStore};
use eddy_types::ShardId;

use crate::config::CliConfig;

/// A ring over in-memory shards, with handles for fault injection.
pub struct LocalCluster {
    pub manager: Arc<RingManager>,
    pub stores: BTreeMap<ShardId, Arc<FlakyStore>>,
}

impl LocalCluster {
    /// Build the start-up ring described by `config`.
    pub fn bootstrap(config: &CliConfig) -> Result<Self> {
        let mut stores = BTreeMap::new();
        let mut shards: Vec<(ShardId, Arc<dyn KvStore>)> = Vec::new();
        for id in config.shard_ids() {
            let store = new_store(config, &id);
            let handle: Arc<dyn KvStore> = store.clone();
            shards.push((id.clone(), handle));
            stores.insert(id, store);
        }

        let manager =
            RingManager::bootstrap(config.ring_config(), config.migration_config(), shards)
                .context("failed to build ring")?;

        Ok(Self { manager, stores })
    }

    /// Create a store for a shard that is not on the ring yet.
    pub fn add_store(&mut self, config: &CliConfig, shard_id: &ShardId) -> Arc<FlakyStore> {
        let store = new_store(config, shard_id);
        self.stores.insert(shard_id.clone(), store.clone());
        store
    }
}

fn new_store(config: &CliConfig, shard_id: &ShardId) -> Arc<FlakyStore> {
    let inner: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let mut store = FlakyStore::new(shard_id.as_str(), inner);
    if let Some([min, max]) = config.store.read_latency_ms {
        store = store.read_latency(min, max);
    }
    if let Some([min, max]) = config.store.write_latency_ms {
        store = store.write_latency(min, max);
    }
    if let Some(seed) = config.store.seed {
        store = store.seed(seed);
    }
    Arc::new(store)
}
