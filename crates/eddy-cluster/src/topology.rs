//! Ring topology manager: the shared ring, the shard registry, and routing.
//!
//! [`RingManager`] is the single in-process authority over which shards are
//! on the ring. Reads take the shared half of one `RwLock` over the ring and
//! registry together; `join`, `leave`, and probe transitions take the
//! exclusive half and keep it until their migrations have finished.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use eddy_placement::{KeyRange, RedistributionPlan, Ring, key_hash};
use eddy_rebalance::{
    MigrationEndpoint, MigrationEngine, MigrationJob, MigrationOutcome, MigrationReport,
};
use eddy_store::KvStore;
use eddy_types::{
    MigrationConfig, RingConfig, RingEvent, ShardId, ShardState, ShardStatus, VirtualNode,
};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::ClusterError;

/// A registered physical shard.
struct PhysicalShard {
    store: Arc<dyn KvStore>,
    ping_failures: u32,
    state: ShardState,
}

/// Ring and registry, guarded together.
struct Topology {
    ring: Ring,
    registry: BTreeMap<ShardId, PhysicalShard>,
}

impl Topology {
    /// Resolve a hash to the active shard that owns it.
    fn resolve(&self, hash: u32) -> Option<(&ShardId, &PhysicalShard)> {
        let shard_id = self.ring.owner_of_hash(hash)?;
        self.registry
            .get_key_value(shard_id)
            .filter(|(_, shard)| shard.state == ShardState::Active)
    }

    fn endpoint(&self, shard_id: &ShardId) -> Option<MigrationEndpoint> {
        self.registry
            .get(shard_id)
            .map(|shard| MigrationEndpoint::new(shard_id.clone(), shard.store.clone()))
    }
}

/// Outcome of one migration task run for a join or leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    pub from: ShardId,
    pub to: ShardId,
    /// Arcs handed over.
    pub ranges: usize,
    /// Counters on success, the failure cause otherwise.
    pub result: Result<MigrationReport, String>,
}

/// What a join or leave did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    /// The shard that joined or left.
    pub shard_id: ShardId,
    /// Virtual nodes inserted or removed.
    pub vnodes: usize,
    /// One entry per migration task, sorted by source then target.
    pub migrations: Vec<MigrationSummary>,
}

impl RebalanceReport {
    /// Total keys written to their new owners.
    pub fn keys_moved(&self) -> u64 {
        self.migrations
            .iter()
            .filter_map(|m| m.result.as_ref().ok())
            .map(|r| r.moved)
            .sum()
    }

    /// Whether every migration task completed.
    pub fn is_clean(&self) -> bool {
        self.migrations.iter().all(|m| m.result.is_ok())
    }
}

/// Result of applying one probe outcome to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeVerdict {
    /// The probe succeeded.
    Healthy,
    /// The probe failed but the shard is still below the threshold.
    Failing,
    /// The shard just crossed the threshold and was marked inactive.
    Evict,
    /// The shard is no longer registered.
    Unknown,
}

/// Shared ring state, routing, and topology changes.
pub struct RingManager {
    topology: RwLock<Topology>,
    engine: MigrationEngine,
    config: RingConfig,
    /// Broadcast channel for topology events.
    event_tx: broadcast::Sender<RingEvent>,
}

impl RingManager {
    /// Create a manager with an empty ring.
    pub fn new(config: RingConfig, migration: MigrationConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            topology: RwLock::new(Topology {
                ring: Ring::new(config.vnodes_per_shard),
                registry: BTreeMap::new(),
            }),
            engine: MigrationEngine::new(migration),
            config,
            event_tx,
        })
    }

    /// Build the start-up ring from a static shard list.
    ///
    /// No keys are migrated: the stores are assumed to already hold the keys
    /// this layout assigns them.
    pub fn bootstrap(
        config: RingConfig,
        migration: MigrationConfig,
        shards: Vec<(ShardId, Arc<dyn KvStore>)>,
    ) -> Result<Arc<Self>, ClusterError> {
        let mut ring = Ring::new(config.vnodes_per_shard);
        let mut registry = BTreeMap::new();
        for (shard_id, store) in shards {
            if registry.contains_key(&shard_id) {
                return Err(ClusterError::AlreadyRegistered(shard_id));
            }
            ring.add_shard(shard_id.clone())?;
            registry.insert(
                shard_id,
                PhysicalShard {
                    store,
                    ping_failures: 0,
                    state: ShardState::Active,
                },
            );
        }
        info!(
            shards = registry.len(),
            vnodes = ring.vnode_count(),
            "ring bootstrapped"
        );

        let (event_tx, _) = broadcast::channel(256);
        Ok(Arc::new(Self {
            topology: RwLock::new(Topology { ring, registry }),
            engine: MigrationEngine::new(migration),
            config,
            event_tx,
        }))
    }

    /// Subscribe to topology events.
    pub fn subscribe(&self) -> broadcast::Receiver<RingEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Shard that owns `key`, or `None` if no active shard is on the ring.
    pub async fn route(&self, key: &str) -> Option<ShardId> {
        let hash = key_hash(key);
        let topology = self.topology.read().await;
        let shard_id = topology.resolve(hash).map(|(id, _)| id.clone());
        self.log_route(key, hash, shard_id.as_ref());
        shard_id
    }

    /// Shard that owns a raw hash position.
    pub async fn route_hash(&self, hash: u32) -> Option<ShardId> {
        let topology = self.topology.read().await;
        topology.resolve(hash).map(|(id, _)| id.clone())
    }

    /// Read `key` from its owning shard.
    ///
    /// Returns `None` when the key is absent, the ring is empty, or the store
    /// call fails.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let hash = key_hash(key);
        let topology = self.topology.read().await;
        let Some((shard_id, shard)) = topology.resolve(hash) else {
            self.log_route(key, hash, None);
            return None;
        };
        self.log_route(key, hash, Some(shard_id));

        match shard.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, %shard_id, error = %e, "get failed");
                None
            }
        }
    }

    /// Write `key` to its owning shard. Returns whether the write was
    /// acknowledged.
    pub async fn set(&self, key: &str, value: Bytes) -> bool {
        let hash = key_hash(key);
        let topology = self.topology.read().await;
        let Some((shard_id, shard)) = topology.resolve(hash) else {
            self.log_route(key, hash, None);
            return false;
        };
        self.log_route(key, hash, Some(shard_id));

        match shard.store.set(key, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, %shard_id, error = %e, "set failed");
                false
            }
        }
    }

    fn log_route(&self, key: &str, hash: u32, shard_id: Option<&ShardId>) {
        let hash = format!("{hash:#010x}");
        match (shard_id, self.config.verbose_routing) {
            (Some(shard_id), true) => info!(key, %hash, %shard_id, "routed key"),
            (Some(shard_id), false) => debug!(key, %hash, %shard_id, "routed key"),
            (None, true) => info!(key, %hash, "no active shard for key"),
            (None, false) => debug!(key, %hash, "no active shard for key"),
        }
    }

    // -----------------------------------------------------------------------
    // Topology changes
    // -----------------------------------------------------------------------

    /// Admit a shard with generated virtual nodes.
    ///
    /// Keys in the arcs the new virtual nodes take over are migrated from
    /// their previous owners before the shard is registered as active.
    #[tracing::instrument(skip(self, shard_id, store), fields(shard = %shard_id))]
    pub async fn join(
        &self,
        shard_id: ShardId,
        store: Arc<dyn KvStore>,
    ) -> Result<RebalanceReport, ClusterError> {
        let mut topology = self.topology.write().await;
        let vnodes = topology
            .ring
            .place_vnodes(&shard_id, self.config.vnodes_per_shard);
        self.join_locked(&mut topology, shard_id, store, vnodes)
            .await
    }

    /// Admit a shard at explicit ring positions.
    #[tracing::instrument(skip(self, shard_id, store, vnodes), fields(shard = %shard_id))]
    pub async fn join_with_vnodes(
        &self,
        shard_id: ShardId,
        store: Arc<dyn KvStore>,
        vnodes: Vec<VirtualNode>,
    ) -> Result<RebalanceReport, ClusterError> {
        let mut topology = self.topology.write().await;
        self.join_locked(&mut topology, shard_id, store, vnodes)
            .await
    }

    async fn join_locked(
        &self,
        topology: &mut Topology,
        shard_id: ShardId,
        store: Arc<dyn KvStore>,
        vnodes: Vec<VirtualNode>,
    ) -> Result<RebalanceReport, ClusterError> {
        if topology.registry.contains_key(&shard_id) {
            return Err(ClusterError::AlreadyRegistered(shard_id));
        }

        let plan = topology.ring.add_shard_with_vnodes(shard_id.clone(), vnodes)?;
        let vnode_count = topology.ring.vnodes_of(&shard_id).map_or(0, <[_]>::len);

        let target = MigrationEndpoint::new(shard_id.clone(), store.clone());
        let jobs = plan_jobs(plan, |owner, ranges| {
            let Some(source) = topology.endpoint(&owner) else {
                warn!(%owner, "previous owner missing from registry");
                return None;
            };
            Some(MigrationJob {
                source,
                target: target.clone(),
                ranges,
            })
        });

        let migrations = self.run_migrations(jobs).await;

        topology.registry.insert(
            shard_id.clone(),
            PhysicalShard {
                store,
                ping_failures: 0,
                state: ShardState::Active,
            },
        );

        let report = RebalanceReport {
            shard_id: shard_id.clone(),
            vnodes: vnode_count,
            migrations,
        };
        info!(%shard_id, vnodes = vnode_count, moved = report.keys_moved(), "shard joined ring");
        let _ = self.event_tx.send(RingEvent::ShardJoined(shard_id));
        Ok(report)
    }

    /// Remove a shard from the ring.
    ///
    /// Each arc the shard owned is migrated to the shard that owns it once
    /// the leaving virtual nodes are gone. When the last shard leaves there
    /// is nowhere to move keys; they stay on its store.
    #[tracing::instrument(skip_all, fields(shard = %shard_id))]
    pub async fn leave(&self, shard_id: &ShardId) -> Result<RebalanceReport, ClusterError> {
        let mut topology = self.topology.write().await;
        let Some(source) = topology.endpoint(shard_id) else {
            return Err(ClusterError::UnknownShard(shard_id.clone()));
        };

        let vnode_count = topology.ring.vnodes_of(shard_id).map_or(0, <[_]>::len);
        let plan = topology.ring.remove_shard(shard_id)?;

        let jobs = plan_jobs(plan, |heir, ranges| {
            let Some(target) = topology.endpoint(&heir) else {
                warn!(%heir, "inheriting shard missing from registry");
                return None;
            };
            Some(MigrationJob {
                source: source.clone(),
                target,
                ranges,
            })
        });
        if jobs.is_empty() && vnode_count > 0 {
            info!(%shard_id, "no remaining shard to migrate keys to");
        }

        let migrations = self.run_migrations(jobs).await;
        topology.registry.remove(shard_id);

        let report = RebalanceReport {
            shard_id: shard_id.clone(),
            vnodes: vnode_count,
            migrations,
        };
        info!(%shard_id, moved = report.keys_moved(), "shard left ring");
        let _ = self.event_tx.send(RingEvent::ShardLeft(shard_id.clone()));
        Ok(report)
    }

    /// Announce and run the removal of a shard declared inactive by the
    /// membership probe.
    pub(crate) async fn evict(&self, shard_id: &ShardId) -> Result<RebalanceReport, ClusterError> {
        warn!(%shard_id, "evicting inactive shard");
        let _ = self
            .event_tx
            .send(RingEvent::ShardEvicted(shard_id.clone()));
        self.leave(shard_id).await
    }

    async fn run_migrations(&self, jobs: Vec<MigrationJob>) -> Vec<MigrationSummary> {
        let ranges: BTreeMap<(ShardId, ShardId), usize> = jobs
            .iter()
            .map(|j| {
                (
                    (j.source.shard_id.clone(), j.target.shard_id.clone()),
                    j.ranges.len(),
                )
            })
            .collect();

        self.engine
            .run_all(jobs)
            .await
            .into_iter()
            .map(|MigrationOutcome { source, target, result }| {
                let event = match &result {
                    Ok(report) => RingEvent::MigrationCompleted {
                        from: source.clone(),
                        to: target.clone(),
                        keys: report.moved,
                    },
                    Err(e) => RingEvent::MigrationFailed {
                        from: source.clone(),
                        to: target.clone(),
                        reason: e.to_string(),
                    },
                };
                let _ = self.event_tx.send(event);

                MigrationSummary {
                    ranges: ranges
                        .get(&(source.clone(), target.clone()))
                        .copied()
                        .unwrap_or_default(),
                    from: source,
                    to: target,
                    result: result.map_err(|e| e.to_string()),
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Membership hooks
    // -----------------------------------------------------------------------

    /// Active shards and their store handles, for probing.
    pub(crate) async fn probe_targets(&self) -> Vec<(ShardId, Arc<dyn KvStore>)> {
        let topology = self.topology.read().await;
        topology
            .registry
            .iter()
            .filter(|(_, shard)| shard.state == ShardState::Active)
            .map(|(id, shard)| (id.clone(), shard.store.clone()))
            .collect()
    }

    /// Apply one probe result to a shard's failure counter and state.
    ///
    /// Results for a shard that is no longer active are ignored and yield
    /// [`ProbeVerdict::Unknown`]; an inactive shard only comes back through
    /// a fresh join.
    pub(crate) async fn record_probe(
        &self,
        shard_id: &ShardId,
        healthy: bool,
        failure_threshold: u32,
    ) -> ProbeVerdict {
        let mut topology = self.topology.write().await;
        let Some(shard) = topology.registry.get_mut(shard_id) else {
            return ProbeVerdict::Unknown;
        };
        if shard.state != ShardState::Active {
            debug!(%shard_id, state = %shard.state, "ignoring result for inactive shard");
            return ProbeVerdict::Unknown;
        }

        if healthy {
            if shard.ping_failures > 0 {
                info!(%shard_id, failures = shard.ping_failures, "shard answered probe again");
            }
            shard.ping_failures = 0;
            return ProbeVerdict::Healthy;
        }

        shard.ping_failures += 1;
        if shard.ping_failures >= failure_threshold {
            shard.state = ShardState::Inactive;
            warn!(%shard_id, failures = shard.ping_failures, "shard marked inactive");
            ProbeVerdict::Evict
        } else {
            debug!(%shard_id, failures = shard.ping_failures, "probe failed");
            ProbeVerdict::Failing
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// All virtual nodes in ascending position order.
    pub async fn snapshot(&self) -> Vec<VirtualNode> {
        self.topology.read().await.ring.snapshot()
    }

    /// Status of every registered shard.
    pub async fn shards(&self) -> Vec<ShardStatus> {
        let topology = self.topology.read().await;
        topology
            .registry
            .iter()
            .map(|(id, shard)| ShardStatus {
                shard_id: id.clone(),
                state: shard.state,
                ping_failures: shard.ping_failures,
                vnode_count: topology.ring.vnodes_of(id).map_or(0, <[_]>::len),
            })
            .collect()
    }

    /// Fraction of the hash space owned by each shard on the ring.
    pub async fn ownership(&self) -> BTreeMap<ShardId, f64> {
        self.topology.read().await.ring.ownership()
    }

    /// Store handle of a registered shard.
    pub async fn store_of(&self, shard_id: &ShardId) -> Option<Arc<dyn KvStore>> {
        let topology = self.topology.read().await;
        topology.registry.get(shard_id).map(|s| s.store.clone())
    }

    /// Number of registered shards.
    pub async fn shard_count(&self) -> usize {
        self.topology.read().await.registry.len()
    }
}

/// Turn a plan into migration jobs, one per counterpart shard.
fn plan_jobs(
    plan: RedistributionPlan,
    mut job: impl FnMut(ShardId, BTreeSet<KeyRange>) -> Option<MigrationJob>,
) -> Vec<MigrationJob> {
    plan.into_iter()
        .filter_map(|(shard_id, ranges)| job(shard_id, ranges))
        .collect()
}
