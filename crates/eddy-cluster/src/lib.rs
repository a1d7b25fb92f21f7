//! Ring topology management and health-probe membership for eddy.
//!
//! This crate provides:
//!
//! - [`RingManager`]: the shared ring and shard registry. Routes keys to
//!   shards, forwards `get`/`set`, and runs `join`/`leave` with key migration.
//! - [`membership`]: the background probe loop that evicts shards failing
//!   consecutive health checks.

mod error;
pub mod membership;
mod topology;


pub use error::ClusterError;
pub use membership::{MembershipHandle, ProbeSummary};
pub use topology::{MigrationSummary, RebalanceReport, RingManager};
