//! Shared test harness for eddy integration tests.
//!
//! Provides [`TestCluster`]: a [`RingManager`] over N in-memory shards, each
//! a [`MemoryStore`] behind a [`FlakyStore`] so tests can inspect raw shard
//! contents and inject failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eddy_cluster::{RebalanceReport, RingManager};
use eddy_store::{FlakyStore, KvStore, MemoryStore};
use eddy_types::{MigrationConfig, RingConfig, RingEvent, ShardId, shard_id_for};
use tokio::sync::broadcast;

// =========================================================================
// Shards
// =========================================================================

/// One in-memory shard.
pub struct TestShard {
    pub id: ShardId,
    /// Raw contents, bypassing fault injection.
    pub memory: Arc<MemoryStore>,
    /// The handle the ring talks to.
    pub flaky: Arc<FlakyStore>,
}

impl TestShard {
    pub fn new(id: ShardId) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(id.as_str(), memory.clone()));
        Self { id, memory, flaky }
    }

    /// Shard with random per-call latency.
    pub fn with_latency(id: ShardId, max_ms: u64, seed: u64) -> Self {
        let memory = Arc::new(MemoryStore::new());
        let flaky = Arc::new(
            FlakyStore::new(id.as_str(), memory.clone())
                .read_latency(0, max_ms)
                .write_latency(0, max_ms)
                .seed(seed),
        );
        Self { id, memory, flaky }
    }

    pub fn store(&self) -> Arc<dyn KvStore> {
        self.flaky.clone()
    }

    /// Whether `key` is physically stored on this shard.
    pub async fn holds(&self, key: &str) -> bool {
        self.memory.get(key).await.unwrap().is_some()
    }
}

// =========================================================================
// Cluster
// =========================================================================

/// A ring over in-memory shards named `cache-node-<i>`.
pub struct TestCluster {
    manager: Arc<RingManager>,
    shards: BTreeMap<ShardId, TestShard>,
    latency_ms: u64,
}

impl TestCluster {
    /// `n` shards with `vnodes` virtual nodes each and default migration
    /// batches.
    pub fn new(n: u16, vnodes: u16) -> Self {
        Self::build(n, vnodes, MigrationConfig::default(), 0)
    }

    /// Like [`new`](Self::new) with a custom scan batch size.
    pub fn with_batch_size(n: u16, vnodes: u16, batch_size: usize) -> Self {
        Self::build(n, vnodes, MigrationConfig { batch_size }, 0)
    }

    /// Shards that sleep up to `max_ms` on every call.
    pub fn with_latency(n: u16, vnodes: u16, max_ms: u64) -> Self {
        Self::build(n, vnodes, MigrationConfig::default(), max_ms)
    }

    fn build(n: u16, vnodes: u16, migration: MigrationConfig, latency_ms: u64) -> Self {
        let shards: BTreeMap<ShardId, TestShard> = (0..n)
            .map(|i| {
                let shard = new_shard(shard_id_for(i), latency_ms, u64::from(i));
                (shard.id.clone(), shard)
            })
            .collect();
        let config = RingConfig {
            vnodes_per_shard: vnodes,
            shard_count: n,
            verbose_routing: false,
        };
        let manager = RingManager::bootstrap(
            config,
            migration,
            shards.values().map(|s| (s.id.clone(), s.store())).collect(),
        )
        .unwrap();

        Self {
            manager,
            shards,
            latency_ms,
        }
    }

    pub fn manager(&self) -> &Arc<RingManager> {
        &self.manager
    }

    /// Any shard created by this cluster, on the ring or not.
    pub fn shard(&self, id: &ShardId) -> &TestShard {
        self.shards
            .get(id)
            .unwrap_or_else(|| panic!("unknown shard {id}"))
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.keys().cloned().collect()
    }

    /// Create a shard and join it to the ring.
    pub async fn join(&mut self, name: &str) -> RebalanceReport {
        let id = ShardId::from(name);
        let seed = self.shards.len() as u64;
        let shard = new_shard(id.clone(), self.latency_ms, seed);
        let store = shard.store();
        self.shards.insert(id.clone(), shard);
        self.manager.join(id, store).await.unwrap()
    }

    /// Remove a shard from the ring. Its store is kept for inspection.
    pub async fn leave(&self, id: &ShardId) -> RebalanceReport {
        self.manager.leave(id).await.unwrap()
    }

    /// Fail every call to the shard's store.
    pub fn kill(&self, id: &ShardId) {
        self.shard(id).flaky.set_down(true);
    }

    pub fn revive(&self, id: &ShardId) {
        self.shard(id).flaky.set_down(false);
    }

    /// Fail only the shard's health pings.
    pub fn fail_pings(&self, id: &ShardId) {
        self.shard(id).flaky.fail_pings(true);
    }

    /// Write `count` keys with the given prefix and return them.
    pub async fn write_keys(&self, prefix: &str, count: usize) -> Vec<String> {
        let keys: Vec<String> = (0..count).map(|i| format!("{prefix}:{i}")).collect();
        for key in &keys {
            assert!(
                self.manager.set(key, value_for(key)).await,
                "write of {key} was not acknowledged"
            );
        }
        keys
    }

    /// Every key reads back its value.
    pub async fn assert_readable(&self, keys: &[String]) {
        for key in keys {
            assert_eq!(
                self.manager.get(key).await,
                Some(value_for(key)),
                "{key} not readable"
            );
        }
    }

    /// Every key is stored on the shard it routes to and nowhere else.
    pub async fn assert_placement(&self, keys: &[String]) {
        self.assert_readable(keys).await;
        for key in keys {
            let owner = self.manager.route(key).await.unwrap();
            for shard in self.shards.values() {
                assert_eq!(
                    shard.holds(key).await,
                    shard.id == owner,
                    "{key} misplaced on {} (owner {owner})",
                    shard.id
                );
            }
        }
    }

    /// Keys stored across all shards, duplicates included.
    pub fn stored_keys(&self) -> usize {
        self.shards.values().map(|s| s.memory.len()).sum()
    }

    /// Which shard each key routes to.
    pub async fn owners(&self, keys: &[String]) -> BTreeMap<String, ShardId> {
        let mut owners = BTreeMap::new();
        for key in keys {
            owners.insert(key.clone(), self.manager.route(key).await.unwrap());
        }
        owners
    }
}

fn new_shard(id: ShardId, latency_ms: u64, seed: u64) -> TestShard {
    if latency_ms == 0 {
        TestShard::new(id)
    } else {
        TestShard::with_latency(id, latency_ms, seed)
    }
}

// =========================================================================
// Helpers
// =========================================================================

/// Deterministic value stored for `key`.
pub fn value_for(key: &str) -> Bytes {
    Bytes::from(format!("value-of-{key}"))
}

/// Wait for the first event matching `pred`, panicking after `timeout`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<RingEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&RingEvent) -> bool,
) -> RingEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or_else(|_| panic!("no matching event within {timeout:?}"))
}

/// Drain every event already queued.
pub fn drain_events(events: &mut broadcast::Receiver<RingEvent>) -> Vec<RingEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return drained,
        }
    }
}
