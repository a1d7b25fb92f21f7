//! Migration engine: moves the keys of changed arcs from one shard to another.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use eddy_placement::{KeyRange, key_hash};
use eddy_store::{Cursor, KvStore, Pipeline, StoreError};
use eddy_types::{MigrationConfig, ShardId};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::MigrationError;

/// One side of a migration: a shard and its store handle.
#[derive(Clone)]
pub struct MigrationEndpoint {
    pub shard_id: ShardId,
    pub store: Arc<dyn KvStore>,
}

impl MigrationEndpoint {
    pub fn new(shard_id: ShardId, store: Arc<dyn KvStore>) -> Self {
        Self { shard_id, store }
    }
}

impl fmt::Debug for MigrationEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEndpoint")
            .field("shard_id", &self.shard_id)
            .finish_non_exhaustive()
    }
}

/// Counters from one migration task.
///
/// `moved` is the number of keys written to the target. The other fields
/// exist for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Keys returned by the source scan, duplicates included.
    pub scanned: u64,
    /// Distinct keys whose hash fell in a migrated arc.
    pub selected: u64,
    /// Keys written to the target.
    pub moved: u64,
    /// Target writes that failed. The source delete runs alongside the
    /// write, so these keys are gone from both shards.
    pub failed_writes: u64,
    /// Source deletes that failed; these keys remain on the source.
    pub failed_deletes: u64,
    /// Scan rounds issued.
    pub rounds: u64,
}

/// A migration to run as part of a batch.
#[derive(Debug, Clone)]
pub struct MigrationJob {
    pub source: MigrationEndpoint,
    pub target: MigrationEndpoint,
    /// Arcs whose keys move from `source` to `target`.
    pub ranges: BTreeSet<KeyRange>,
}

/// Result of one [`MigrationJob`].
#[derive(Debug)]
pub struct MigrationOutcome {
    pub source: ShardId,
    pub target: ShardId,
    pub result: Result<MigrationReport, MigrationError>,
}

/// Moves keys between shard stores after a topology change.
#[derive(Debug, Clone)]
pub struct MigrationEngine {
    config: MigrationConfig,
}

impl MigrationEngine {
    /// Create an engine with the given tuning.
    pub fn new(config: MigrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Move every key of `source` whose hash lies in one of `ranges` to
    /// `target`.
    ///
    /// The source is scanned until its cursor returns to the start. Each
    /// round fetches the selected keys in one `MGET`, then issues the target
    /// `SET` pipeline and the source `DEL` pipeline concurrently. A scan or
    /// fetch failure aborts the task; keys moved by earlier rounds stay
    /// moved.
    #[tracing::instrument(
        skip_all,
        fields(from = %source.shard_id, to = %target.shard_id, ranges = ranges.len())
    )]
    pub async fn migrate(
        &self,
        source: &MigrationEndpoint,
        target: &MigrationEndpoint,
        ranges: &BTreeSet<KeyRange>,
    ) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport::default();
        if ranges.is_empty() || source.shard_id == target.shard_id {
            return Ok(report);
        }

        let mut cursor = Cursor::start();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let page = source
                .store
                .scan(&cursor, self.config.batch_size)
                .await
                .map_err(MigrationError::store(&source.shard_id))?;
            report.rounds += 1;
            report.scanned += page.keys.len() as u64;

            let selected: Vec<String> = page
                .keys
                .into_iter()
                .filter(|key| {
                    let hash = key_hash(key);
                    ranges.iter().any(|r| r.contains(hash))
                })
                .filter(|key| seen.insert(key.clone()))
                .collect();

            if !selected.is_empty() {
                report.selected += selected.len() as u64;
                self.move_batch(source, target, selected, &mut report).await?;
            }

            cursor = page.cursor;
            if cursor.is_done() {
                break;
            }
        }

        if report.failed_writes > 0 || report.failed_deletes > 0 {
            warn!(
                moved = report.moved,
                failed_writes = report.failed_writes,
                failed_deletes = report.failed_deletes,
                "migration finished with failures"
            );
        } else {
            info!(moved = report.moved, rounds = report.rounds, "migration finished");
        }
        Ok(report)
    }

    /// Fetch one round of selected keys and move them.
    async fn move_batch(
        &self,
        source: &MigrationEndpoint,
        target: &MigrationEndpoint,
        keys: Vec<String>,
        report: &mut MigrationReport,
    ) -> Result<(), MigrationError> {
        let values = source
            .store
            .mget(&keys)
            .await
            .map_err(MigrationError::store(&source.shard_id))?;

        let mut writes = Pipeline::new();
        let mut deletes = Pipeline::new();
        for (key, value) in keys.into_iter().zip(values) {
            let Some(value) = value else {
                debug!(%key, "key vanished before fetch, skipping");
                continue;
            };
            writes.set(key.clone(), value);
            deletes.del(key);
        }
        if writes.is_empty() {
            return Ok(());
        }

        let batch = writes.len() as u64;
        let (written, deleted) =
            tokio::join!(target.store.exec(writes), source.store.exec(deletes));

        let (ok, failed) = tally(written, batch, &target.shard_id, "write");
        report.moved += ok;
        report.failed_writes += failed;
        let (_, failed) = tally(deleted, batch, &source.shard_id, "delete");
        report.failed_deletes += failed;

        debug!(batch, moved = report.moved, "migration round applied");
        Ok(())
    }

    /// Run several migrations concurrently, one task each.
    ///
    /// A failing task is logged and reported in its outcome; it never
    /// cancels the others. Outcomes are sorted by source then target.
    pub async fn run_all(&self, jobs: Vec<MigrationJob>) -> Vec<MigrationOutcome> {
        let mut tasks = JoinSet::new();
        for job in jobs {
            let engine = self.clone();
            tasks.spawn(async move {
                let result = engine.migrate(&job.source, &job.target, &job.ranges).await;
                MigrationOutcome {
                    source: job.source.shard_id,
                    target: job.target.shard_id,
                    result,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Err(e) = &outcome.result {
                        warn!(
                            from = %outcome.source,
                            to = %outcome.target,
                            error = %e,
                            "migration task failed"
                        );
                    }
                    outcomes.push(outcome);
                }
                Err(e) => warn!(error = %e, "migration task did not complete"),
            }
        }
        outcomes.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        outcomes
    }
}

/// Count successes and failures of one executed pipeline.
fn tally(
    results: Result<Vec<Result<(), StoreError>>, StoreError>,
    batch: u64,
    shard_id: &ShardId,
    what: &'static str,
) -> (u64, u64) {
    match results {
        Ok(results) => {
            let mut failed = 0;
            for err in results.iter().filter_map(|r| r.as_ref().err()) {
                failed += 1;
                warn!(%shard_id, error = %err, "migration {what} failed");
            }
            (batch.saturating_sub(failed), failed)
        }
        Err(e) => {
            warn!(%shard_id, error = %e, batch, "migration {what} pipeline failed");
            (0, batch)
        }
    }
}
