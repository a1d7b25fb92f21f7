//! In-memory key-value store backend.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use bytes::Bytes;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{Cursor, KvStore, Pipeline, PipelineOp, ScanPage};

/// Prefix of every non-terminal cursor issued by [`MemoryStore`].
const CURSOR_PREFIX: char = 'k';

/// In-memory key-value store backed by a `RwLock<BTreeMap>`.
///
/// Stands in for a real shard in tests and in the daemon's in-process
/// cluster. Scan cursors encode the last key returned, so a scan survives
/// concurrent writes and never skips a key that existed for its whole
/// duration.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored keys in ascending order.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn decode_cursor(cursor: &Cursor) -> Result<Bound<String>, StoreError> {
        if cursor.is_done() {
            return Ok(Bound::Unbounded);
        }
        cursor
            .as_str()
            .strip_prefix(CURSOR_PREFIX)
            .map(|last| Bound::Excluded(last.to_string()))
            .ok_or_else(|| StoreError::InvalidCursor(cursor.to_string()))
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let map = self.entries.read().expect("lock poisoned");
        Ok(map.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        debug!(key, size = value.len(), "storing value in memory");
        map.insert(key.to_string(), value);
        Ok(())
    }

    async fn scan(&self, cursor: &Cursor, count: usize) -> Result<ScanPage, StoreError> {
        let lower = Self::decode_cursor(cursor)?;
        let map = self.entries.read().expect("lock poisoned");

        let mut iter = map
            .range::<String, _>((lower, Bound::Unbounded))
            .map(|(k, _)| k);
        let keys: Vec<String> = iter.by_ref().take(count.max(1)).cloned().collect();

        let cursor = match (iter.next(), keys.last()) {
            (Some(_), Some(last)) => Cursor::new(format!("{CURSOR_PREFIX}{last}")),
            _ => Cursor::start(),
        };
        Ok(ScanPage { cursor, keys })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let map = self.entries.read().expect("lock poisoned");
        Ok(keys.iter().map(|k| map.get(k).cloned()).collect())
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        let mut map = self.entries.write().expect("lock poisoned");
        let ops = pipeline.into_ops();
        debug!(ops = ops.len(), "executing pipeline in memory");
        Ok(ops
            .into_iter()
            .map(|op| {
                match op {
                    PipelineOp::Set { key, value } => {
                        map.insert(key, value);
                    }
                    PipelineOp::Del { key } => {
                        map.remove(&key);
                    }
                }
                Ok(())
            })
            .collect())
    }
}
