//! Durable Session Store
//!
//! Where evicted sessions park their persisted state until the client
//! reconnects. The registry only speaks to the [`SessionStore`] trait; the
//! in-process [`MemoryStore`] backs tests and single-node deployments.
//!
//! Entries carry an expiry. Expired entries are invisible to `load` and
//! `touch` and are swept lazily.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreBackendError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),

    #[error("session store is closed")]
    Closed,

    #[error("session store serialization failed: {0}")]
    Serialization(String),
}

/// Async key/value persistence for session snapshots.
pub trait SessionStore: Send + Sync {
    fn save<'a>(&'a self, id: &'a str, bytes: Vec<u8>, ttl: Duration) -> BoxFuture<'a, Result<(), StoreBackendError>>;

    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreBackendError>>;

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StoreBackendError>>;

    /// Extend an entry's expiry. Returns whether the entry existed.
    fn touch<'a>(&'a self, id: &'a str, ttl: Duration) -> BoxFuture<'a, Result<bool, StoreBackendError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), StoreBackendError>>;

    /// Save several snapshots; stops at the first failure.
    fn save_all<'a>(
        &'a self,
        batch: HashMap<String, Vec<u8>>,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreBackendError>> {
        Box::pin(async move {
            for (id, bytes) in batch {
                self.save(&id, bytes, ttl).await?;
            }
            Ok(())
        })
    }
}

/// Process-local store with per-entry expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, (Vec<u8>, Instant)>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries that have not expired.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|entry| entry.value().1 > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired session snapshots");
        }
        removed
    }

    fn ensure_open(&self) -> Result<(), StoreBackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreBackendError::Closed)
        } else {
            Ok(())
        }
    }
}

impl SessionStore for MemoryStore {
    fn save<'a>(&'a self, id: &'a str, bytes: Vec<u8>, ttl: Duration) -> BoxFuture<'a, Result<(), StoreBackendError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.entries.insert(id.to_string(), (bytes, Instant::now() + ttl));
            Ok(())
        })
    }

    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>, StoreBackendError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = Instant::now();
            let expired = match self.entries.get(id) {
                Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
                Some(_) => true,
                None => false,
            };
            if expired {
                self.entries.remove(id);
            }
            Ok(None)
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StoreBackendError>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.entries.remove(id);
            Ok(())
        })
    }

    fn touch<'a>(&'a self, id: &'a str, ttl: Duration) -> BoxFuture<'a, Result<bool, StoreBackendError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = Instant::now();
            match self.entries.get_mut(id) {
                Some(mut entry) if entry.1 > now => {
                    entry.1 = now + ttl;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), StoreBackendError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.entries.clear();
            Ok(())
        })
    }
}

// ---- Tests ----

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn save_load_delete() {
        let store = MemoryStore::new();
        store.save("a", vec![1, 2, 3], HOUR).await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.load("b").await.unwrap(), None);
        store.delete("a").await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let store = MemoryStore::new();
        store.save("a", vec![1], Duration::ZERO).await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), None);
        assert!(!store.touch("a", HOUR).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn touch_extends_live_entries() {
        let store = MemoryStore::new();
        store.save("a", vec![1], Duration::from_millis(50)).await.unwrap();
        assert!(store.touch("a", HOUR).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.load("a").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn save_all_and_sweep() {
        let store = MemoryStore::new();
        let batch = HashMap::from([("a".to_string(), vec![1]), ("b".to_string(), vec![2])]);
        store.save_all(batch, HOUR).await.unwrap();
        store.save("gone", vec![0], Duration::ZERO).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.sweep(), 1);
    }

    #[tokio::test]
    async fn closed_store_refuses_work() {
        let store = MemoryStore::new();
        store.save("a", vec![1], HOUR).await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.load("a").await, Err(StoreBackendError::Closed));
        assert_eq!(store.save("a", vec![1], HOUR).await, Err(StoreBackendError::Closed));
    }
}
