//! In-memory backend (default, thread-safe, async).
//!
//! Uses DashMap for lock-free concurrent access with per-key sharding.
//! Conditional operations (add, increment, the lock primitives) run inside a
//! single DashMap entry, which holds the shard lock for the whole
//! read-modify-write, so they are atomic with respect to every other caller
//! in the process.

use super::KeyValueBackend;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// In-memory entry with optional expiration.
struct StoredEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|d| Instant::now() + d);
        StoredEntry { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// Thread-safe async in-memory backend.
///
/// Expiry is measured with `tokio::time::Instant`, so tests running on a
/// paused runtime can advance leases and TTLs deterministically.
///
/// # Example
///
/// ```no_run
/// use lease_cache::backend::{InMemoryBackend, KeyValueBackend};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = InMemoryBackend::new();
///
///     backend.set("key1", b"value".to_vec(), None).await?;
///     assert!(backend.get("key1").await?.is_some());
///
///     backend.set("key2", b"expires".to_vec(), Some(Duration::from_secs(300))).await?;
///     assert!(!backend.add("key2", b"other".to_vec(), None).await?);
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    store: Arc<DashMap<String, StoredEntry>>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        InMemoryBackend {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        self.store.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, `None` when absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.store.get(key).and_then(|e| {
            if e.is_expired() {
                None
            } else {
                e.expires_at
                    .map(|exp| exp.saturating_duration_since(Instant::now()))
            }
        })
    }

    /// Memory statistics.
    pub fn stats(&self) -> StoreStats {
        let total_bytes: usize = self.store.iter().map(|entry| entry.data.len()).sum();
        let expired_count = self.store.iter().filter(|entry| entry.is_expired()).count();

        StoreStats {
            total_entries: self.store.len(),
            expired_entries: expired_count,
            total_bytes,
        }
    }

    /// Print statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Store Stats: {} entries ({} expired), {} bytes",
            stats.total_entries, stats.expired_entries, stats.total_bytes
        );
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, e| !e.is_expired());
        before - self.store.len()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired() {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(entry.data.clone()));
            }
        }

        self.store.remove_if(key, |_, e| e.is_expired());
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.store
            .insert(key.to_string(), StoredEntry::new(value, ttl));

        if let Some(d) = ttl {
            debug!("✓ InMemory SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ InMemory SET {}", key);
        }

        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let stored = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(StoredEntry::new(value, ttl));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(StoredEntry::new(value, ttl));
                true
            }
        };

        debug!("✓ InMemory ADD {} -> {}", key, stored);
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .store
            .remove(key)
            .is_some_and(|(_, e)| !e.is_expired());
        debug!("✓ InMemory DELETE {}", key);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.get(key).is_some_and(|e| !e.is_expired()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let updated = match self.store.get_mut(key) {
            Some(mut e) if !e.is_expired() => {
                e.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        };
        debug!("✓ InMemory EXPIRE {} ({:?}) -> {}", key, ttl, updated);
        Ok(updated)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let value = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                let current = if e.get().is_expired() {
                    e.get_mut().expires_at = None;
                    0
                } else {
                    parse_integer(key, &e.get().data)?
                };
                let next = current.checked_add(delta).ok_or_else(|| {
                    Error::BackendError(format!("increment would overflow for key {}", key))
                })?;
                e.get_mut().data = next.to_string().into_bytes();
                next
            }
            Entry::Vacant(e) => {
                e.insert(StoredEntry::new(delta.to_string().into_bytes(), None));
                delta
            }
        };

        debug!("✓ InMemory INCRBY {} {} -> {}", key, delta, value);
        Ok(value)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let results: Vec<Option<Vec<u8>>> = keys
            .iter()
            .map(|k| {
                self.store
                    .get(*k)
                    .filter(|entry| !entry.is_expired())
                    .map(|entry| entry.data.clone())
            })
            .collect();

        debug!("✓ InMemory MGET {} keys", keys.len());
        Ok(results)
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self
                .store
                .remove(*key)
                .is_some_and(|(_, e)| !e.is_expired())
            {
                removed += 1;
            }
        }

        debug!("✓ InMemory MDELETE {} keys ({} removed)", keys.len(), removed);
        Ok(removed)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all entries cleared!");
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let before = self.store.len();
        self.store.retain(|k, _| !k.starts_with(namespace));
        let removed = (before - self.store.len()) as u64;
        warn!(
            "⚠ InMemory CLEAR {}* executed - {} entries removed",
            namespace, removed
        );
        Ok(removed)
    }

    async fn acquire_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let acquired = match self.store.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().is_expired() {
                    e.insert(StoredEntry::new(token.as_bytes().to_vec(), Some(lease)));
                    true
                } else if e.get().data == token.as_bytes() {
                    e.get_mut().expires_at = Some(Instant::now() + lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(StoredEntry::new(token.as_bytes().to_vec(), Some(lease)));
                true
            }
        };

        debug!("✓ InMemory LOCK {} -> {}", key, acquired);
        Ok(acquired)
    }

    async fn renew_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let renewed = match self.store.get_mut(key) {
            Some(mut e) if !e.is_expired() && e.data == token.as_bytes() => {
                e.expires_at = Some(Instant::now() + lease);
                true
            }
            _ => false,
        };

        debug!("✓ InMemory RENEW {} -> {}", key, renewed);
        Ok(renewed)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let released = self
            .store
            .remove_if(key, |_, e| !e.is_expired() && e.data == token.as_bytes())
            .is_some();

        debug!("✓ InMemory UNLOCK {} -> {}", key, released);
        Ok(released)
    }
}

fn parse_integer(key: &str, data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| {
            Error::BackendError(format!("value at key {} is not an integer", key))
        })
}

/// Store statistics.
#[derive(Clone, Debug)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}
