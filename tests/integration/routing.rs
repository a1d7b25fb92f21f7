//! Integration test: key routing over a static ring.
//!
//! Verifies that keys land on the shard the ring assigns them, that routing
//! is deterministic, and that concurrent clients see a consistent ring.

use std::collections::BTreeMap;
use std::sync::Arc;

use eddy_cluster::RingManager;
use eddy_integration_tests::{TestCluster, value_for};
use eddy_placement::{Ring, key_hash};
use eddy_types::{MigrationConfig, RingConfig, ShardId};

/// Writes through the manager end up on the owning shard only.
#[tokio::test]
async fn test_writes_land_on_owner() {
    let c = TestCluster::new(3, 5);
    let keys = c.write_keys("user", 500).await;

    c.assert_placement(&keys).await;
    assert_eq!(c.stored_keys(), 500);
}

/// Two independently built rings with the same shards agree on every key.
#[tokio::test]
async fn test_routing_is_deterministic() {
    let a = TestCluster::new(4, 16);
    let b = TestCluster::new(4, 16);

    for i in 0..1000 {
        let key = format!("order:{i}");
        assert_eq!(
            a.manager().route(&key).await,
            b.manager().route(&key).await,
            "{key} routed differently"
        );
    }
}

/// The manager's routing matches a bare placement ring.
#[tokio::test]
async fn test_manager_agrees_with_placement_ring() {
    let c = TestCluster::new(5, 32);

    let mut ring = Ring::new(32);
    for id in c.shard_ids() {
        ring.add_shard(id).unwrap();
    }

    for i in 0..1000 {
        let key = format!("session:{i}");
        assert_eq!(
            c.manager().route(&key).await.as_ref(),
            ring.owner(&key),
            "{key}"
        );
        assert_eq!(
            c.manager().route_hash(key_hash(&key)).await.as_ref(),
            ring.owner(&key)
        );
    }
}

/// With enough virtual nodes every shard gets a share of the keys.
#[tokio::test]
async fn test_every_shard_receives_keys() {
    let c = TestCluster::new(4, 64);
    let keys = c.write_keys("product", 4000).await;

    let mut per_shard: BTreeMap<ShardId, usize> = BTreeMap::new();
    for owner in c.owners(&keys).await.into_values() {
        *per_shard.entry(owner).or_default() += 1;
    }

    assert_eq!(per_shard.len(), 4);
    for (shard, count) in &per_shard {
        assert!(*count > 400, "{shard} only got {count} of 4000 keys");
    }

    let ownership = c.manager().ownership().await;
    let total: f64 = ownership.values().sum();
    assert!((total - 1.0).abs() < 1e-9, "ownership sums to {total}");
}

/// Reads of a missing key and routing on an empty ring return nothing.
#[tokio::test]
async fn test_missing_and_unroutable_keys() {
    let c = TestCluster::new(3, 5);
    assert_eq!(c.manager().get("never-written").await, None);

    let empty = RingManager::new(RingConfig::default(), MigrationConfig::default());
    assert_eq!(empty.route("user:1001").await, None);
    assert_eq!(empty.get("user:1001").await, None);
    assert!(!empty.set("user:1001", value_for("user:1001")).await);
}

/// Many concurrent clients read and write without interfering.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(30000)]
async fn test_concurrent_clients() {
    let c = Arc::new(TestCluster::with_latency(3, 16, 2));

    let mut tasks = Vec::new();
    for client in 0..8 {
        let c = c.clone();
        tasks.push(tokio::spawn(async move {
            let keys = c.write_keys(&format!("client{client}"), 50).await;
            c.assert_readable(&keys).await;
            keys
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    c.assert_placement(&all).await;
    assert_eq!(c.stored_keys(), 400);
}
