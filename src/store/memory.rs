use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{CadenceError, Result};
use crate::store::{CasOutcome, KvEntry, Store};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn to_entry(&self, key: &str) -> KvEntry {
        KvEntry {
            key: key.to_string(),
            value: self.value.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, StoredValue>,
    revision: u64,
}

impl Inner {
    fn live(&self, key: &str, now: Instant) -> Option<&StoredValue> {
        self.entries.get(key).filter(|v| v.is_live(now))
    }

    fn write(&mut self, key: &str, value: String, ttl: Option<Duration>, now: Instant) -> u64 {
        self.revision += 1;
        let version = self.revision;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                version,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        version
    }
}

/// In-process store. One mutex makes every operation linearizable; TTLs
/// are evaluated against this process's monotonic clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: while offline every call fails with
    /// `StoreUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Latest revision handed out.
    pub async fn revision(&self) -> u64 {
        self.inner.lock().await.revision
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CadenceError::StoreUnavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        self.check_online()?;
        let inner = self.inner.lock().await;
        Ok(inner.live(key, Instant::now()).map(|v| v.to_entry(key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        self.check_online()?;
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, v)| v.is_live(now))
            .map(|(k, v)| v.to_entry(k))
            .collect())
    }

    async fn put(&self, key: &str, value: String) -> Result<u64> {
        self.check_online()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.write(key, value, None, Instant::now()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let current = inner.live(key, now).map(|v| v.to_entry(key));

        let matches = match (&current, expected) {
            (None, None) => true,
            (Some(entry), Some(version)) => entry.version == version,
            _ => false,
        };
        if !matches {
            return Ok(CasOutcome::Mismatch { current });
        }

        let version = inner.write(key, value, ttl, now);
        Ok(CasOutcome::Swapped { version })
    }

    async fn refresh(&self, key: &str, version: u64, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(key) {
            Some(v) if v.is_live(now) && v.version == version => {
                v.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<Option<KvEntry>> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .entries
            .remove(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.to_entry(key)))
    }

    async fn compare_and_delete(&self, key: &str, version: u64) -> Result<bool> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let matches = inner.live(key, now).map_or(false, |v| v.version == version);
        if matches {
            inner.entries.remove(key);
        }
        Ok(matches)
    }
}
