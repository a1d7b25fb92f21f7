//! Per-shard key-value store interface and in-process backends.
//!
//! This crate defines the [`KvStore`] trait every shard is reached through,
//! along with two implementations:
//!
//! - [`MemoryStore`]: ordered in-memory map with cursor-based scanning.
//! - [`FlakyStore`]: wrapper adding seeded latency and switchable faults.

mod error;
mod flaky_store;
mod memory_store;
mod traits;

pub use error::StoreError;
pub use flaky_store::FlakyStore;
pub use memory_store::MemoryStore;
pub use traits::{Cursor, KvStore, Pipeline, PipelineOp, ScanPage};
