//! Key migration between shards for eddy.
//!
//! When a shard joins or leaves the ring, the [`RedistributionPlan`] computed
//! by `eddy-placement` names the arcs of the hash space that change owner.
//! The [`MigrationEngine`] moves the keys in those arcs from one shard's
//! store to another: it scans the source in batches, selects keys whose hash
//! lies in one of the arcs, fetches them in one `MGET`, then writes them to
//! the target and deletes them from the source with two concurrent
//! pipelines.
//!
//! Migration is at-least-once. A failed write or delete is counted and
//! logged but never retried or rolled back, so a key can briefly exist on
//! both shards.
//!
//! [`RedistributionPlan`]: eddy_placement::RedistributionPlan

mod engine;
mod error;

pub use engine::{MigrationEndpoint, MigrationEngine, MigrationJob, MigrationOutcome, MigrationReport};
pub use error::MigrationError;
