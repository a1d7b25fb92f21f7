//! Core trait and types for talking to a shard's store.

use std::fmt;

use bytes::Bytes;

use crate::error::StoreError;

/// Opaque scan cursor. `"0"` both starts a scan and signals its end.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(String);

impl Cursor {
    /// The cursor that starts a full scan.
    pub fn start() -> Self {
        Self("0".to_string())
    }

    /// Wrap a cursor value returned by a store.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Whether the store signalled the end of the scan.
    pub fn is_done(&self) -> bool {
        self.0 == "0"
    }

    /// Return the raw cursor value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page of a cursor scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; [`Cursor::is_done`] when the scan is over.
    pub cursor: Cursor,
    /// Keys returned by this call. May repeat keys from earlier pages.
    pub keys: Vec<String>,
}

/// A single command queued in a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOp {
    /// Store `value` under `key`.
    Set { key: String, value: Bytes },
    /// Remove `key`.
    Del { key: String },
}

impl PipelineOp {
    /// Key addressed by the command.
    pub fn key(&self) -> &str {
        match self {
            PipelineOp::Set { key, .. } | PipelineOp::Del { key } => key,
        }
    }
}

/// Batch of commands sent to a store in one round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    ops: Vec<PipelineOp>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `SET`.
    pub fn set(&mut self, key: impl Into<String>, value: Bytes) -> &mut Self {
        self.ops.push(PipelineOp::Set {
            key: key.into(),
            value,
        });
        self
    }

    /// Queue a `DEL`.
    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(PipelineOp::Del { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued commands in submission order.
    pub fn ops(&self) -> &[PipelineOp] {
        &self.ops
    }

    /// Consume the pipeline, returning its commands.
    pub fn into_ops(self) -> Vec<PipelineOp> {
        self.ops
    }
}

impl Extend<PipelineOp> for Pipeline {
    fn extend<I: IntoIterator<Item = PipelineOp>>(&mut self, iter: I) {
        self.ops.extend(iter);
    }
}

impl FromIterator<PipelineOp> for Pipeline {
    fn from_iter<I: IntoIterator<Item = PipelineOp>>(iter: I) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

/// Client handle for one shard's key-value store.
///
/// All implementations must be `Send + Sync` so a handle can be shared by
/// routing calls, the membership probe and migration tasks.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync {
    /// Lightweight liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Read a value. Returns `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    /// Return up to roughly `count` keys starting at `cursor`.
    async fn scan(&self, cursor: &Cursor, count: usize) -> Result<ScanPage, StoreError>;

    /// Read several keys at once; the result is aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError>;

    /// Execute a pipeline, returning one result per queued command.
    ///
    /// The outer error means nothing was applied; inner errors report
    /// individual commands that failed while the rest went through.
    async fn exec(&self, pipeline: Pipeline) -> Result<Vec<Result<(), StoreError>>, StoreError>;
}
