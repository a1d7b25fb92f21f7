//! Integration test: shard failure and probe-driven eviction.
//!
//! The membership controller pings every shard; a shard failing the
//! threshold number of consecutive probes is evicted and its keys migrate
//! to the survivors when its data is still reachable.

use std::collections::BTreeSet;
use std::time::Duration;

use eddy_cluster::{MembershipHandle, membership};
use eddy_integration_tests::{TestCluster, drain_events, wait_for_event};
use eddy_types::{MembershipConfig, RingEvent, ShardId, shard_id_for};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn manual_config() -> MembershipConfig {
    MembershipConfig {
        probe_interval: Duration::from_secs(3600),
        ..MembershipConfig::test_config()
    }
}

/// Poll until the controller's evicted set equals `expected`.
async fn wait_for_evicted(handle: &MembershipHandle, expected: &[ShardId]) {
    for _ in 0..200 {
        if handle.evicted().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("evicted set never became {expected:?}");
}

/// A shard that stops answering pings is evicted and loses no keys.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_ping_failure_evicts_without_loss() {
    let c = TestCluster::new(4, 16);
    let keys = c.write_keys("user", 1000).await;
    let victim = shard_id_for(2);
    let mut events = c.manager().subscribe();

    c.fail_pings(&victim);
    let handle = membership::start(c.manager().clone(), MembershipConfig::test_config());
    wait_for_event(&mut events, EVENT_TIMEOUT, |e| {
        *e == RingEvent::ShardLeft(victim.clone())
    })
    .await;
    handle.shutdown();

    assert_eq!(c.manager().shard_count().await, 3);
    assert!(c.shard(&victim).memory.is_empty());
    c.assert_placement(&keys).await;
}

/// Eviction is announced once, before the shard leaves.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_eviction_announced_once() {
    let c = TestCluster::new(3, 8);
    c.write_keys("post", 300).await;
    let victim = shard_id_for(0);
    let mut events = c.manager().subscribe();

    let handle = membership::start(c.manager().clone(), manual_config());
    tokio::time::sleep(Duration::from_millis(50)).await;
    c.fail_pings(&victim);

    for _ in 0..2 {
        let summary = handle.probe_now().await;
        assert_eq!(summary.failing, vec![victim.clone()]);
        assert!(summary.evicted.is_empty());
    }
    let summary = handle.probe_now().await;
    assert_eq!(summary.evicted, vec![victim.clone()]);

    // Further rounds no longer probe the evicted shard.
    let summary = handle.probe_now().await;
    assert!(summary.failing.is_empty());
    assert_eq!(summary.healthy.len(), 2);
    handle.shutdown();

    let events = drain_events(&mut events);
    let evicted = events
        .iter()
        .filter(|e| **e == RingEvent::ShardEvicted(victim.clone()))
        .count();
    let left = events
        .iter()
        .position(|e| *e == RingEvent::ShardLeft(victim.clone()));
    let announced = events
        .iter()
        .position(|e| *e == RingEvent::ShardEvicted(victim.clone()));
    assert_eq!(evicted, 1);
    assert!(left.is_some());
    assert!(announced < left, "{events:?}");
}

/// Failures below the threshold are forgotten once the shard answers.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_transient_failure_not_evicted() {
    let c = TestCluster::new(3, 8);
    let victim = shard_id_for(1);

    let handle = membership::start(c.manager().clone(), manual_config());
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..3 {
        c.fail_pings(&victim);
        handle.probe_now().await;
        handle.probe_now().await;
        c.shard(&victim).flaky.fail_pings(false);
        let summary = handle.probe_now().await;
        assert!(summary.healthy.contains(&victim));
    }
    handle.shutdown();

    assert_eq!(c.manager().shard_count().await, 3);
    let status = c.manager().shards().await;
    assert!(status.iter().all(|s| s.ping_failures == 0));
}

/// A shard that goes fully down cannot hand over its keys: its migrations
/// fail, the shard is still removed, and only its keys become unreadable.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_hard_failure_loses_only_victim_keys() {
    let c = TestCluster::new(4, 16);
    let keys = c.write_keys("order", 1000).await;
    let owners = c.owners(&keys).await;
    let victim = shard_id_for(3);
    let mut events = c.manager().subscribe();

    c.kill(&victim);
    let handle = membership::start(c.manager().clone(), MembershipConfig::test_config());
    let failed = wait_for_event(&mut events, EVENT_TIMEOUT, |e| {
        matches!(e, RingEvent::MigrationFailed { from, .. } if *from == victim)
    })
    .await;
    wait_for_event(&mut events, EVENT_TIMEOUT, |e| {
        *e == RingEvent::ShardLeft(victim.clone())
    })
    .await;
    handle.shutdown();

    let RingEvent::MigrationFailed { reason, .. } = failed else {
        unreachable!();
    };
    assert!(reason.contains(victim.as_str()), "{reason}");

    let lost: Vec<&String> = keys.iter().filter(|k| owners[*k] == victim).collect();
    assert!(!lost.is_empty());
    assert_eq!(c.shard(&victim).memory.len(), lost.len());
    for key in &keys {
        let readable = c.manager().get(key).await.is_some();
        assert_eq!(readable, owners[key] != victim, "{key}");
    }
}

/// With re-admission enabled an evicted shard rejoins once it recovers.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_recovered_shard_rejoins() {
    let c = TestCluster::new(3, 16);
    let keys = c.write_keys("session", 900).await;
    let victim = shard_id_for(0);
    let mut events = c.manager().subscribe();

    let config = MembershipConfig {
        rejoin_on_recovery: true,
        ..MembershipConfig::test_config()
    };
    c.fail_pings(&victim);
    let handle = membership::start(c.manager().clone(), config);

    wait_for_event(&mut events, EVENT_TIMEOUT, |e| {
        *e == RingEvent::ShardLeft(victim.clone())
    })
    .await;
    wait_for_evicted(&handle, &[victim.clone()]).await;
    c.assert_placement(&keys).await;

    c.shard(&victim).flaky.fail_pings(false);
    wait_for_event(&mut events, EVENT_TIMEOUT, |e| {
        *e == RingEvent::ShardJoined(victim.clone())
    })
    .await;
    wait_for_evicted(&handle, &[]).await;
    handle.shutdown();

    assert_eq!(c.manager().shard_count().await, 3);
    assert!(!c.shard(&victim).memory.is_empty());
    c.assert_placement(&keys).await;
}

/// Two shards failing together are both evicted.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_two_failures() {
    let c = TestCluster::new(5, 16);
    let keys = c.write_keys("comment", 1000).await;
    let mut events = c.manager().subscribe();

    let victims = [shard_id_for(1), shard_id_for(3)];
    for victim in &victims {
        c.fail_pings(victim);
    }
    let handle = membership::start(c.manager().clone(), MembershipConfig::test_config());
    let mut pending: BTreeSet<ShardId> = victims.iter().cloned().collect();
    while !pending.is_empty() {
        let event = wait_for_event(&mut events, EVENT_TIMEOUT, |e| {
            matches!(e, RingEvent::ShardLeft(id) if pending.contains(id))
        })
        .await;
        if let RingEvent::ShardLeft(id) = event {
            pending.remove(&id);
        }
    }
    handle.shutdown();

    assert_eq!(c.manager().shard_count().await, 3);
    c.assert_placement(&keys).await;
}

/// The probe loop exits after shutdown.
#[tokio::test]
#[ntest::timeout(10000)]
async fn test_shutdown_stops_probe_loop() {
    let c = TestCluster::new(2, 4);
    let handle = membership::start(c.manager().clone(), MembershipConfig::test_config());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_running());

    handle.shutdown();
    for _ in 0..100 {
        if !handle.is_running() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("probe loop still running after shutdown");
}
