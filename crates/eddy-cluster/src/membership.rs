//! Health-probe membership controller.
//!
//! The controller pings every active shard's store on a fixed interval. A
//! shard that fails `failure_threshold` consecutive probes is marked
//! inactive and removed from the ring through [`RingManager::leave`], which
//! migrates its keys to the shards that now own them.
//!
//! Evicted shards are not re-admitted unless
//! [`MembershipConfig::rejoin_on_recovery`] is set, in which case they keep
//! being probed and rejoin through [`RingManager::join`] once they answer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use eddy_store::KvStore;
use eddy_types::{MembershipConfig, ShardId};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::ClusterError;
use crate::topology::{ProbeVerdict, RingManager};

/// Shortest probe period the loop will run at.
const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// What one probe round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    /// Shards that answered.
    pub healthy: Vec<ShardId>,
    /// Shards that failed but stay on the ring for now.
    pub failing: Vec<ShardId>,
    /// Shards removed from the ring this round.
    pub evicted: Vec<ShardId>,
    /// Previously evicted shards re-admitted this round.
    pub rejoined: Vec<ShardId>,
}

/// Drives the probe state machine against a [`RingManager`].
pub(crate) struct MembershipController {
    manager: Arc<RingManager>,
    config: MembershipConfig,
    /// Shards evicted by the probe, kept for re-admission.
    evicted: Mutex<BTreeMap<ShardId, Arc<dyn KvStore>>>,
}

impl MembershipController {
    pub(crate) fn new(manager: Arc<RingManager>, config: MembershipConfig) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config,
            evicted: Mutex::new(BTreeMap::new()),
        })
    }

    /// Run the probe loop until shutdown.
    async fn run(self: Arc<Self>, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        let period = probe_period(self.config.probe_interval);
        info!(
            interval_ms = period.as_millis() as u64,
            threshold = self.config.failure_threshold,
            "membership controller started"
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("membership controller shutting down");
                    break;
                }
            }
        }

        info!("membership controller stopped");
    }

    /// Probe every active shard once and apply the results.
    pub(crate) async fn probe_once(&self) -> ProbeSummary {
        let mut summary = ProbeSummary::default();

        let targets = self.manager.probe_targets().await;
        for (shard_id, healthy) in ping_all(targets).await {
            let verdict = self
                .manager
                .record_probe(&shard_id, healthy, self.config.failure_threshold)
                .await;
            match verdict {
                ProbeVerdict::Healthy => summary.healthy.push(shard_id),
                ProbeVerdict::Failing => summary.failing.push(shard_id),
                ProbeVerdict::Evict => {
                    if self.evict(&shard_id).await {
                        summary.evicted.push(shard_id);
                    }
                }
                ProbeVerdict::Unknown => {
                    debug!(%shard_id, "shard left or went inactive before its result was applied");
                }
            }
        }

        if self.config.rejoin_on_recovery {
            summary.rejoined = self.rejoin_recovered().await;
        }
        summary
    }

    /// Remove a shard that crossed the failure threshold.
    async fn evict(&self, shard_id: &ShardId) -> bool {
        let store = self.manager.store_of(shard_id).await;
        match self.manager.evict(shard_id).await {
            Ok(report) => {
                if !report.is_clean() {
                    warn!(%shard_id, "eviction finished with failed migrations");
                }
                if self.config.rejoin_on_recovery
                    && let Some(store) = store
                {
                    self.evicted.lock().await.insert(shard_id.clone(), store);
                }
                true
            }
            Err(e) => {
                error!(%shard_id, error = %e, "failed to evict shard");
                false
            }
        }
    }

    /// Re-admit evicted shards that answer a ping again.
    async fn rejoin_recovered(&self) -> Vec<ShardId> {
        let candidates: Vec<(ShardId, Arc<dyn KvStore>)> = {
            let evicted = self.evicted.lock().await;
            evicted
                .iter()
                .map(|(id, store)| (id.clone(), store.clone()))
                .collect()
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let stores: BTreeMap<ShardId, Arc<dyn KvStore>> = candidates.iter().cloned().collect();
        let mut rejoined = Vec::new();
        for (shard_id, healthy) in ping_all(candidates).await {
            if !healthy {
                continue;
            }
            let Some(store) = stores.get(&shard_id).cloned() else {
                continue;
            };
            match self.manager.join(shard_id.clone(), store).await {
                Ok(_) => {
                    info!(%shard_id, "evicted shard recovered and rejoined");
                    self.evicted.lock().await.remove(&shard_id);
                    rejoined.push(shard_id);
                }
                Err(ClusterError::AlreadyRegistered(_)) => {
                    debug!(%shard_id, "evicted shard was re-added elsewhere");
                    self.evicted.lock().await.remove(&shard_id);
                }
                Err(e) => warn!(%shard_id, error = %e, "failed to rejoin recovered shard"),
            }
        }
        rejoined
    }
}

/// Probe period actually used; `tokio::time::interval` panics on zero.
pub(crate) fn probe_period(configured: Duration) -> Duration {
    if configured < MIN_PROBE_INTERVAL {
        warn!(
            configured_ms = configured.as_millis() as u64,
            "probe interval too short, using 1ms"
        );
        return MIN_PROBE_INTERVAL;
    }
    configured
}

/// Ping each store concurrently. Results are sorted by shard ID.
async fn ping_all(targets: Vec<(ShardId, Arc<dyn KvStore>)>) -> Vec<(ShardId, bool)> {
    let mut pings = JoinSet::new();
    for (shard_id, store) in targets {
        pings.spawn(async move {
            let healthy = match store.ping().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(%shard_id, error = %e, "ping failed");
                    false
                }
            };
            (shard_id, healthy)
        });
    }

    let mut results = Vec::with_capacity(pings.len());
    while let Some(joined) = pings.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "ping task did not complete"),
        }
    }
    results.sort();
    results
}

/// Handle to a running membership controller.
pub struct MembershipHandle {
    controller: Arc<MembershipController>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl MembershipHandle {
    /// Return the managed ring.
    pub fn manager(&self) -> &Arc<RingManager> {
        &self.controller.manager
    }

    /// Run one probe round immediately, outside the timer.
    pub async fn probe_now(&self) -> ProbeSummary {
        self.controller.probe_once().await
    }

    /// Shards evicted by the probe and awaiting re-admission.
    pub async fn evicted(&self) -> Vec<ShardId> {
        self.controller.evicted.lock().await.keys().cloned().collect()
    }

    /// Stop the probe loop. In-flight migrations are not awaited.
    pub fn shutdown(&self) {
        info!("stopping membership controller");
        let _ = self.shutdown_tx.send(true);
    }

    /// Abort the background task.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Check whether the background task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Start the membership controller and return a handle.
///
/// Spawns a background task that probes every active shard each
/// `probe_interval` and evicts shards that fail too often.
pub fn start(manager: Arc<RingManager>, config: MembershipConfig) -> MembershipHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let controller = MembershipController::new(manager, config);

    let task = tokio::spawn(controller.clone().run(shutdown_rx));

    MembershipHandle {
        controller,
        shutdown_tx,
        task,
    }
}
