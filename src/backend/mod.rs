//! Key-value backend implementations.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

mod any;
pub mod inmemory;
#[cfg(feature = "memcached")]
pub mod memcached;
#[cfg(feature = "redis")]
pub mod redis;

pub use any::AnyBackend;
pub use inmemory::InMemoryBackend;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedBackend, MemcachedConfig};
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisBackend, RedisConfig, ScriptRegistry};

/// Trait for key-value backend implementations.
///
/// Abstracts the primitive operations the cache facade and the distributed
/// lock are built on. Keys arrive already prefixed; backends never namespace.
///
/// **IMPORTANT:** All methods use `&self` to allow concurrent access.
/// Backend implementations should use interior mutability or external storage.
///
/// **ASYNC:** Every method returns a `Send` future so work can be moved onto
/// spawned tasks (the lock watcher renews from its own task). Implementations
/// can still write plain `async fn`.
///
/// **LOCKS:** `acquire_lock`, `renew_lock` and `release_lock` must each be a
/// single atomic operation on the store. A backend that cannot offer that
/// keeps the default `NotImplemented` bodies.
pub trait KeyValueBackend: Send + Sync + Clone + 'static {
    /// Retrieve value by key.
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` - Value found
    /// - `Ok(None)` - Key absent or expired
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs (connection lost, etc.)
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Store value with optional TTL. `None` = never expires.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Store value only if the key does not exist yet.
    ///
    /// # Returns
    /// `Ok(true)` when stored, `Ok(false)` when the key was already present.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn add(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Remove value. Returns whether an entry was removed.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Change the TTL of an existing key. Returns `false` if the key is absent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn expire(&self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// Add `delta` (possibly negative) to an integer value, creating it at 0
    /// first when absent. Returns the new value.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or the stored value is not an integer
    fn incr_by(&self, key: &str, delta: i64) -> impl Future<Output = Result<i64>> + Send;

    /// Check if key exists.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Bulk get operation.
    ///
    /// Default implementation calls `get()` for each key.
    /// Override for batch efficiency (e.g., Redis MGET).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn mget(&self, keys: &[&str]) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await?);
            }
            Ok(results)
        }
    }

    /// Bulk existence check, results in input order.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn mexists(&self, keys: &[&str]) -> impl Future<Output = Result<Vec<bool>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.exists(key).await?);
            }
            Ok(results)
        }
    }

    /// Bulk set with a shared TTL.
    ///
    /// # Errors
    /// Returns `Err` on the first failing write; earlier writes are kept.
    fn mset(
        &self,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            for (key, value) in entries {
                self.set(&key, value, ttl).await?;
            }
            Ok(())
        }
    }

    /// Bulk delete operation. Returns how many entries were removed.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn mdelete(&self, keys: &[&str]) -> impl Future<Output = Result<u64>> + Send {
        async move {
            let mut removed = 0;
            for key in keys {
                if self.delete(key).await? {
                    removed += 1;
                }
            }
            Ok(removed)
        }
    }

    /// Bulk expire, results in input order.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn mexpire(
        &self,
        entries: &[(&str, Duration)],
    ) -> impl Future<Output = Result<Vec<bool>>> + Send {
        async move {
            let mut results = Vec::with_capacity(entries.len());
            for (key, ttl) in entries {
                results.push(self.expire(key, *ttl).await?);
            }
            Ok(results)
        }
    }

    /// Bulk increment, results in input order.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn mincr_by(&self, entries: &[(&str, i64)]) -> impl Future<Output = Result<Vec<i64>>> + Send {
        async move {
            let mut results = Vec::with_capacity(entries.len());
            for (key, delta) in entries {
                results.push(self.incr_by(key, *delta).await?);
            }
            Ok(results)
        }
    }

    /// Health check - verify backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }

    /// Remove every key in the store (use with caution).
    ///
    /// # Errors
    /// Returns `Err` if operation is not implemented or fails
    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(Error::NotImplemented(
                "clear_all not implemented for this backend".to_string(),
            ))
        }
    }

    /// Remove every key starting with `namespace`. Returns how many were removed.
    ///
    /// # Errors
    /// Returns `Err` if operation is not implemented or fails
    fn clear_namespace(&self, _namespace: &str) -> impl Future<Output = Result<u64>> + Send {
        async {
            Err(Error::NotImplemented(
                "clear_namespace not implemented for this backend".to_string(),
            ))
        }
    }

    /// Atomically take `key` for `token` with a `lease` TTL.
    ///
    /// Succeeds when the key is absent, or already holds `token` (the TTL is
    /// then refreshed). Fails, without error, when another token holds it.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or locking is unsupported
    fn acquire_lock(
        &self,
        _key: &str,
        _token: &str,
        _lease: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        async {
            Err(Error::NotImplemented(
                "distributed locks not supported by this backend".to_string(),
            ))
        }
    }

    /// Atomically extend `key`'s TTL to `lease` if it still holds `token`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or locking is unsupported
    fn renew_lock(
        &self,
        _key: &str,
        _token: &str,
        _lease: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        async {
            Err(Error::NotImplemented(
                "distributed locks not supported by this backend".to_string(),
            ))
        }
    }

    /// Atomically delete `key` if it still holds `token`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or locking is unsupported
    fn release_lock(&self, _key: &str, _token: &str) -> impl Future<Output = Result<bool>> + Send {
        async {
            Err(Error::NotImplemented(
                "distributed locks not supported by this backend".to_string(),
            ))
        }
    }
}

/// Lease as whole milliseconds, never zero (a zero PX/TTL is rejected by stores).
pub(crate) fn lease_millis(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}
