//! A [`KvStore`] wrapper that adds random latency and switchable faults.
//!
//! `FlakyStore` wraps any `Arc<dyn KvStore>`, sleeps for a random duration
//! before each call, and has runtime fault switches (see the setters). The
//! RNG is seeded so runs are reproducible.
//!
//! # Example
//!
//! ```ignore
//! let flaky = FlakyStore::new("cache-node-1", inner)
//!     .read_latency(1, 5)
//!     .write_latency(2, 10)
//!     .seed(42);
//! flaky.set_down(true); // every call, including ping, now fails
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::{Cursor, KvStore, Pipeline, PipelineOp, ScanPage};

/// A [`KvStore`] wrapper that injects latency and failures.
pub struct FlakyStore {
    name: String,
    inner: Arc<dyn KvStore>,
    read_latency_ms: (u64, u64),
    write_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    down: AtomicBool,
    fail_pings: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FlakyStore {
    /// Wrap an existing store; no latency and no faults by default.
    pub fn new(name: impl Into<String>, inner: Arc<dyn KvStore>) -> Self {
        Self {
            name: name.into(),
            inner,
            read_latency_ms: (0, 0),
            write_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            down: AtomicBool::new(false),
            fail_pings: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// Set the read latency range in milliseconds (uniform random).
    pub fn read_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.read_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the write latency range in milliseconds (uniform random).
    pub fn write_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.write_latency_ms = (min_ms, max_ms);
        self
    }

    /// Set the RNG seed for deterministic behaviour.
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`], or recover.
    pub fn set_down(&self, down: bool) {
        debug!(store = %self.name, down, "flaky store availability changed");
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail only `ping`; data calls keep working.
    pub fn fail_pings(&self, fail: bool) {
        debug!(store = %self.name, fail, "flaky store ping failures changed");
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Reject `set` calls and pipelined `SET`s.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reject pipelined `DEL`s.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    fn check_up(&self) -> Result<(), StoreError> {
        if self.is_down() {
            return Err(StoreError::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    fn rejects(&self, op: &PipelineOp) -> bool {
        match op {
            PipelineOp::Set { .. } => self.fail_writes.load(Ordering::SeqCst),
            PipelineOp::Del { .. } => self.fail_deletes.load(Ordering::SeqCst),
        }
    }

    /// Sleep for a random duration in `[min, max]` milliseconds.
    async fn delay(&self, range: (u64, u64)) {
        let (min, max) = range;

        if max == 0 {
            return;
        }

        let ms = if min >= max {
            max
        } else {
            self.rng
                .lock()
                .expect("rng lock poisoned")
                .random_range(min..=max)
        };

        if ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait::async_trait]
impl KvStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.delay(self.read_latency_ms).await;
        self.check_up()?;
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(self.name.clone()));
        }
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.check_up()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.delay(self.write_latency_ms).await;
        self.check_up()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                op: "set",
                key: key.to_string(),
            });
        }
        self.inner.set(key, value).await
    }

    async fn scan(&self, cursor: &Cursor, count: usize) -> Result<ScanPage, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.check_up()?;
        self.inner.scan(cursor, count).await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, StoreError> {
        self.delay(self.read_latency_ms).await;
        self.check_up()?;
        self.inner.mget(keys).await
    }

    async fn exec(&self, pipeline: Pipeline) -> Result<Vec<Result<(), StoreError>>, StoreError> {
        self.delay(self.write_latency_ms).await;
        self.check_up()?;

        let (rejected, allowed): (Vec<_>, Vec<_>) = pipeline
            .into_ops()
            .into_iter()
            .enumerate()
            .partition(|(_, op)| self.rejects(op));

        let mut results: Vec<Option<Result<(), StoreError>>> =
            (0..rejected.len() + allowed.len()).map(|_| None).collect();
        for (i, op) in rejected {
            let op_name = match op {
                PipelineOp::Set { .. } => "set",
                PipelineOp::Del { .. } => "del",
            };
            results[i] = Some(Err(StoreError::Rejected {
                op: op_name,
                key: op.key().to_string(),
            }));
        }

        let (indices, ops): (Vec<usize>, Pipeline) = allowed.into_iter().unzip();
        if !ops.is_empty() {
            let applied = self.inner.exec(ops).await?;
            for (i, result) in indices.into_iter().zip(applied) {
                results[i] = Some(result);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(StoreError::Unavailable(self.name.clone()))))
            .collect())
    }
}
