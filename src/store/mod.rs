//! Linearizable key-value store used for all cross-node state.
//!
//! Three things live here:
//! - **Job** definitions, keyed by name
//! - **Execution** records, keyed by job, group and node
//! - the **Leadership Token**, a single leased key
//!
//! Every cross-node mutation goes through [`Store::compare_and_swap`]. No
//! node trusts another node's in-memory state.
//!
//! # Components
//!
//! - [`Store`]: the capability trait
//! - [`MemoryStore`]: in-process implementation, also served to peers
//! - [`RemoteStore`]: HTTP client for a store hosted by another node
//! - [`JobStore`]: typed access used by the rest of the crate

pub mod jobs;
pub mod memory;
pub mod remote;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use jobs::{DispatchClaim, JobStore, LeadershipToken};
pub use memory::MemoryStore;
pub use remote::{store_router, RemoteStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    /// Store-wide revision of the last write to this key.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CasOutcome {
    Swapped { version: u64 },
    Mismatch { current: Option<KvEntry> },
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Read a live (non-expired) entry.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Live entries whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>>;

    /// Unconditional write without expiry. Returns the new version.
    async fn put(&self, key: &str, value: String) -> Result<u64>;

    /// Write only if the current version equals `expected`. `None` expects
    /// the key to be absent or expired. A `ttl` makes the entry expire
    /// at the store's clock unless refreshed.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome>;

    /// Extend the TTL of a live entry at `version` without changing it.
    async fn refresh(&self, key: &str, version: u64, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<Option<KvEntry>>;

    async fn compare_and_delete(&self, key: &str, version: u64) -> Result<bool>;
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(2))
    }
}

/// Retry `op` while it fails with a retryable error, up to `attempts` tries.
pub async fn retry_store<T, F, Fut>(attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::default();
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = backoff.next_delay();
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying store operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
