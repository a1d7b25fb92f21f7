//! Integration test: rebalancing when a shard leaves.
//!
//! The leaving shard's keys move to the shards that inherit its arcs; keys
//! owned by other shards stay where they are.

use eddy_cluster::ClusterError;
use eddy_integration_tests::{TestCluster, drain_events};
use eddy_types::{RingEvent, ShardId, shard_id_for};

/// Removing one of four shards hands its keys to the survivors.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_leave_moves_keys_to_heirs() {
    let c = TestCluster::new(4, 16);
    let keys = c.write_keys("user", 2000).await;
    let before = c.owners(&keys).await;

    let leaving = shard_id_for(2);
    let held = c.shard(&leaving).memory.len() as u64;
    assert!(held > 0);

    let report = c.leave(&leaving).await;
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.vnodes, 16);
    assert_eq!(report.keys_moved(), held);

    let after = c.owners(&keys).await;
    for key in &keys {
        assert_ne!(after[key], leaving);
        if before[key] != leaving {
            assert_eq!(after[key], before[key], "{key} moved although its owner stayed");
        }
    }

    assert!(c.shard(&leaving).memory.is_empty());
    c.assert_placement(&keys).await;
    assert_eq!(c.manager().shard_count().await, 3);
}

/// A leave announces its migrations and then the departure.
#[tokio::test]
async fn test_leave_events() {
    let c = TestCluster::new(3, 8);
    c.write_keys("post", 300).await;
    let mut events = c.manager().subscribe();

    let leaving = shard_id_for(0);
    let report = c.leave(&leaving).await;
    let events = drain_events(&mut events);

    assert_eq!(events.last(), Some(&RingEvent::ShardLeft(leaving.clone())));
    for migration in &report.migrations {
        assert_eq!(migration.from, leaving);
        assert!(events.contains(&RingEvent::MigrationCompleted {
            from: leaving.clone(),
            to: migration.to.clone(),
            keys: migration.result.as_ref().unwrap().moved,
        }));
    }
}

/// Deletes that fail on the source leave a stale copy behind but never
/// affect reads.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_failed_deletes_leave_stale_copies() {
    let c = TestCluster::new(3, 8);
    let keys = c.write_keys("session", 900).await;

    let leaving = shard_id_for(1);
    let held = c.shard(&leaving).memory.len();
    c.shard(&leaving).flaky.fail_deletes(true);

    let report = c.leave(&leaving).await;
    let failed_deletes: u64 = report
        .migrations
        .iter()
        .map(|m| m.result.as_ref().unwrap().failed_deletes)
        .sum();

    assert_eq!(failed_deletes as usize, held);
    assert_eq!(c.shard(&leaving).memory.len(), held);
    c.assert_readable(&keys).await;
    assert_eq!(c.stored_keys(), 900 + held);
}

/// Draining the ring shard by shard keeps every key readable until the last
/// shard, whose keys stay on its store with nowhere to go.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_drain_ring() {
    let c = TestCluster::new(4, 8);
    let keys = c.write_keys("order", 800).await;

    for i in 0..3 {
        let report = c.leave(&shard_id_for(i)).await;
        assert!(report.is_clean());
        c.assert_placement(&keys).await;
    }

    let last = shard_id_for(3);
    assert_eq!(c.shard(&last).memory.len(), 800);

    let report = c.leave(&last).await;
    assert!(report.migrations.is_empty());
    assert_eq!(c.shard(&last).memory.len(), 800);
    assert_eq!(c.manager().route("order:1").await, None);
    assert_eq!(c.manager().get("order:1").await, None);
}

/// Leaving twice, or leaving a shard that never joined, is an error.
#[tokio::test]
async fn test_leave_unknown_shard() {
    let c = TestCluster::new(2, 4);
    let leaving = shard_id_for(0);
    c.leave(&leaving).await;

    assert!(matches!(
        c.manager().leave(&leaving).await,
        Err(ClusterError::UnknownShard(id)) if id == leaving
    ));
    assert!(matches!(
        c.manager().leave(&ShardId::from("ghost")).await,
        Err(ClusterError::UnknownShard(_))
    ));
}

/// A shard that left can join again and takes back the same arcs.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_leave_then_rejoin() {
    let mut c = TestCluster::new(3, 16);
    let keys = c.write_keys("comment", 1200).await;
    let before = c.owners(&keys).await;

    c.leave(&shard_id_for(1)).await;
    c.assert_placement(&keys).await;

    let report = c.join("cache-node-1").await;
    assert!(report.is_clean());
    assert_eq!(c.owners(&keys).await, before);
    c.assert_placement(&keys).await;
}
