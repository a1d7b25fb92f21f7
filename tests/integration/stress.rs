//! Integration test: stress.
//!
//! Many keys, many virtual nodes, and long sequences of topology changes
//! with clients running alongside.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use eddy_integration_tests::{TestCluster, value_for};
use eddy_types::{ShardId, shard_id_for};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 10,000 keys survive a seeded sequence of joins and leaves.
#[tokio::test]
#[ntest::timeout(120000)]
async fn test_random_topology_changes() {
    let mut c = TestCluster::new(4, 64);
    let keys = c.write_keys("user", 10_000).await;

    let mut rng = StdRng::seed_from_u64(2024);
    let mut on_ring: Vec<ShardId> = (0..4).map(shard_id_for).collect();
    let mut next = 4u16;

    for _ in 0..12 {
        let leave = on_ring.len() > 2 && (on_ring.len() >= 7 || rng.random_bool(0.5));
        if leave {
            let idx = rng.random_range(0..on_ring.len());
            let id = on_ring.swap_remove(idx);
            let report = c.leave(&id).await;
            assert!(report.is_clean(), "{report:?}");
            assert!(c.shard(&id).memory.is_empty(), "{id} kept keys after leaving");
        } else {
            let id = shard_id_for(next);
            next += 1;
            let report = c.join(id.as_str()).await;
            assert!(report.is_clean(), "{report:?}");
            on_ring.push(id);
        }
        assert_eq!(c.manager().shard_count().await, on_ring.len());
        assert_eq!(c.stored_keys(), keys.len());
    }

    c.assert_placement(&keys).await;
}

/// Readers never see a pre-written key go missing while shards join and
/// leave under latency.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(120000)]
async fn test_reads_during_churn() {
    let mut c = TestCluster::with_latency(4, 32, 1);
    let keys = Arc::new(c.write_keys("order", 1000).await);
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for r in 0..4 {
        let manager = c.manager().clone();
        let keys = keys.clone();
        let done = done.clone();
        readers.push(tokio::spawn(async move {
            let mut reads = 0u64;
            let mut i = r * 97;
            while !done.load(Ordering::SeqCst) {
                let key = &keys[i % keys.len()];
                assert_eq!(manager.get(key).await, Some(value_for(key)), "{key} missing");
                reads += 1;
                i += 1;
            }
            reads
        }));
    }

    for i in 4..7 {
        let report = c.join(&format!("cache-node-{i}")).await;
        assert!(report.is_clean());
    }
    for i in [0, 5, 2] {
        let report = c.leave(&shard_id_for(i)).await;
        assert!(report.is_clean());
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    c.assert_placement(&keys).await;
}

/// Writers racing topology changes still land every key on its final owner.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(120000)]
async fn test_writes_during_churn() {
    let mut c = TestCluster::with_latency(3, 32, 1);

    let mut writers = Vec::new();
    for w in 0..4 {
        let manager = c.manager().clone();
        writers.push(tokio::spawn(async move {
            let mut written = Vec::new();
            for i in 0..250 {
                let key = format!("writer{w}:{i}");
                assert!(manager.set(&key, value_for(&key)).await, "{key} rejected");
                written.push(key);
            }
            written
        }));
    }

    c.join("cache-node-3").await;
    c.leave(&shard_id_for(1)).await;
    c.join("cache-node-4").await;

    let mut keys = Vec::new();
    for writer in writers {
        keys.extend(writer.await.unwrap());
    }
    assert_eq!(keys.len(), 1000);
    c.assert_placement(&keys).await;
}
