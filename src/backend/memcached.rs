//! Memcached backend implementation.
//!
//! Memcached has no compare-and-delete, so the token-fenced lock primitives
//! stay unsupported here and `Cache::lock` reports `NotImplemented`.

use super::KeyValueBackend;
use crate::error::{Error, Result};
use async_memcached::AsciiProtocol;
use deadpool_memcached::{Manager, Object, Pool};
use std::time::Duration;

/// Default Memcached connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with MEMCACHED_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Configuration for Memcached backend.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>, // e.g., ["localhost:11211", "cache2:11211"]
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            servers: vec!["localhost:11211".to_string()],
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

impl MemcachedConfig {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// # Environment Variables
    /// - `MEMCACHED_SERVERS`: comma-separated `host:port` list
    /// - `MEMCACHED_POOL_SIZE`: connection pool size (default: 16)
    pub fn from_env() -> Self {
        let defaults = MemcachedConfig::default();
        let servers = std::env::var("MEMCACHED_SERVERS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.servers);
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.pool_size);

        MemcachedConfig {
            servers,
            pool_size,
            connection_timeout: defaults.connection_timeout,
        }
    }
}

/// Memcached TTLs are whole seconds and 0 means "never expires", so any
/// finite duration is rounded up to at least one second.
fn expiration(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| {
        let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
        secs.max(1) as i64
    })
}

fn is_status(e: &impl std::fmt::Display, status: &str) -> bool {
    e.to_string().to_lowercase().contains(status)
}

/// Memcached backend with connection pooling and async operations.
///
/// Provides distributed caching using Memcached protocol via async connection pool.
///
/// # Example
///
/// ```no_run
/// # use lease_cache::backend::{MemcachedBackend, MemcachedConfig, KeyValueBackend};
/// # use lease_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let config = MemcachedConfig {
///     servers: vec!["localhost:11211".to_string()],
///     ..Default::default()
/// };
///
/// let backend = MemcachedBackend::new(config).await?;
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedBackend {
    pool: Pool,
}

impl MemcachedBackend {
    /// Create new Memcached backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub async fn new(config: MemcachedConfig) -> Result<Self> {
        // deadpool-memcached Manager takes a single server address
        // Use the first server from the list
        let addr = config
            .servers
            .first()
            .ok_or_else(|| Error::ConfigError("No memcached servers specified".to_string()))?
            .clone();

        let manager = Manager::new(addr.clone());

        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Memcached backend initialized with server: {} (pool size: {})",
            addr, config.pool_size
        );

        Ok(MemcachedBackend { pool })
    }

    /// Create from server address directly.
    ///
    /// Pool size is determined by:
    /// 1. `MEMCACHED_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub async fn from_server(addr: String) -> Result<Self> {
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let config = MemcachedConfig {
            servers: vec![addr],
            pool_size,
            ..Default::default()
        };
        Self::new(config).await
    }

    async fn connection(&self) -> Result<Object> {
        self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })
    }
}

impl KeyValueBackend for MemcachedBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;

        match conn.get(key).await {
            Ok(Some(value)) => {
                debug!("✓ Memcached GET {} -> HIT", key);
                Ok(value.data)
            }
            Ok(None) => {
                debug!("✓ Memcached GET {} -> MISS", key);
                Ok(None)
            }
            Err(e) => Err(Error::BackendError(format!(
                "Memcached GET failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;

        // set(key, value, ttl, flags); no TTL = item never expires (but may be evicted)
        conn.set(key, value.as_slice(), expiration(ttl), None)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Memcached SET failed for key {}: {}", key, e))
            })?;

        if let Some(d) = ttl {
            debug!("✓ Memcached SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ Memcached SET {}", key);
        }

        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.connection().await?;

        match conn.add(key, value.as_slice(), expiration(ttl), None).await {
            Ok(()) => {
                debug!("✓ Memcached ADD {} -> stored", key);
                Ok(true)
            }
            Err(e) if is_status(&e, "not stored") => {
                debug!("✓ Memcached ADD {} -> exists", key);
                Ok(false)
            }
            Err(e) => Err(Error::BackendError(format!(
                "Memcached ADD failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        match conn.delete(key).await {
            Ok(()) => {
                debug!("✓ Memcached DELETE {}", key);
                Ok(true)
            }
            Err(e) if is_status(&e, "not found") => Ok(false),
            Err(e) => Err(Error::BackendError(format!(
                "Memcached DELETE failed for key {}: {}",
                key, e
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        // Memcached doesn't have native EXISTS, use get to check
        let mut conn = self.connection().await?;

        match conn.get(key).await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(Error::BackendError(format!(
                "Memcached EXISTS check failed for key {}: {}",
                key, e
            ))),
        }
    }

    /// Memcached has no TTL update command (`touch` is not exposed by the
    /// client), so the value is read and written back. Not atomic.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self.get(key).await? {
            Some(value) => {
                self.set(key, value, Some(ttl)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A missing key is created with `delta`; Memcached clamps decrements at zero.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection().await?;

        // Second round only runs when another client created the key between
        // our failed increment and our add.
        for _ in 0..2 {
            let outcome = if delta >= 0 {
                conn.increment(key, delta.unsigned_abs()).await
            } else {
                conn.decrement(key, delta.unsigned_abs()).await
            };

            match outcome {
                Ok(value) => {
                    debug!("✓ Memcached INCR {} {} -> {}", key, delta, value);
                    return Ok(value as i64);
                }
                Err(e) if is_status(&e, "not found") => {}
                Err(e) => {
                    return Err(Error::BackendError(format!(
                        "Memcached INCR failed for key {}: {}",
                        key, e
                    )))
                }
            }

            let initial = delta.max(0);
            let encoded = initial.to_string();
            match conn.add(key, encoded.as_bytes(), None, None).await {
                Ok(()) => {
                    debug!("✓ Memcached INCR {} {} -> {} (created)", key, delta, initial);
                    return Ok(initial);
                }
                Err(e) if is_status(&e, "not stored") => continue,
                Err(e) => {
                    return Err(Error::BackendError(format!(
                        "Memcached ADD failed for key {}: {}",
                        key, e
                    )))
                }
            }
        }

        Err(Error::BackendError(format!(
            "Memcached INCR failed for key {}: key kept disappearing",
            key
        )))
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;

        // Note: get_multi may return "not found" error if no keys exist
        let values = match conn.get_multi(keys).await {
            Ok(vals) => vals,
            Err(e) => {
                if is_status(&e, "not found") {
                    debug!("✓ Memcached MGET {} keys (all miss)", keys.len());
                    return Ok(vec![None; keys.len()]);
                }
                return Err(Error::BackendError(format!("Memcached MGET failed: {}", e)));
            }
        };

        let mut value_map = std::collections::HashMap::with_capacity(values.len());
        for value in values {
            let key_str = String::from_utf8_lossy(&value.key).to_string();
            if let Some(data) = value.data {
                value_map.insert(key_str, data);
            }
        }

        // Preserve input order and handle missing keys
        let results = keys.iter().map(|key| value_map.remove(*key)).collect();

        debug!("✓ Memcached MGET {} keys (batch operation)", keys.len());
        Ok(results)
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }

        debug!("✓ Memcached MDELETE {} keys ({} removed)", keys.len(), removed);
        Ok(removed)
    }

    async fn health_check(&self) -> Result<bool> {
        match self.pool.get().await {
            Ok(mut conn) => match conn.get("__health_check__").await {
                Ok(_) => Ok(true),
                Err(_) => Ok(false),
            },
            Err(_) => Ok(false),
        }
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        conn.flush_all()
            .await
            .map_err(|e| Error::BackendError(format!("Memcached FLUSH_ALL failed: {}", e)))?;

        warn!("⚠ Memcached FLUSH_ALL executed - all cache cleared!");
        Ok(())
    }

    /// Memcached cannot enumerate keys, so clearing a namespace clears the
    /// whole server. The removed count is unknown and reported as 0.
    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        warn!(
            "⚠ Memcached cannot clear namespace {:?} selectively; flushing everything",
            namespace
        );
        self.clear_all().await?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcached_config_default() {
        let config = MemcachedConfig::default();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0], "localhost:11211");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
    }

    #[test]
    fn test_expiration_rounds_up_to_whole_seconds() {
        assert_eq!(expiration(None), None);
        assert_eq!(expiration(Some(Duration::from_millis(10))), Some(1));
        assert_eq!(expiration(Some(Duration::from_millis(1500))), Some(2));
        assert_eq!(expiration(Some(Duration::from_secs(30))), Some(30));
    }

    #[tokio::test]
    async fn test_memcached_backend_no_servers_error() {
        let config = MemcachedConfig {
            servers: vec![],
            ..Default::default()
        };

        let result = MemcachedBackend::new(config).await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    // Integration tests - require running memcached server
    // Run with: cargo test --features memcached -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_memcached_backend_add_and_delete() {
        let backend = MemcachedBackend::from_server("localhost:11211".to_string())
            .await
            .expect("Failed to create backend");

        backend.delete("unit:add").await.expect("Failed to delete");
        assert!(backend.add("unit:add", b"a".to_vec(), None).await.unwrap());
        assert!(!backend.add("unit:add", b"b".to_vec(), None).await.unwrap());
        assert!(backend.delete("unit:add").await.unwrap());
        assert!(!backend.delete("unit:add").await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_memcached_backend_incr_creates_missing() {
        let backend = MemcachedBackend::from_server("localhost:11211".to_string())
            .await
            .expect("Failed to create backend");

        backend.delete("unit:counter").await.expect("Failed to delete");
        assert_eq!(backend.incr_by("unit:counter", 5).await.unwrap(), 5);
        assert_eq!(backend.incr_by("unit:counter", 2).await.unwrap(), 7);
        assert_eq!(backend.incr_by("unit:counter", -3).await.unwrap(), 4);
    }

    #[tokio::test]
    #[ignore]
    async fn test_memcached_backend_has_no_locks() {
        let backend = MemcachedBackend::from_server("localhost:11211".to_string())
            .await
            .expect("Failed to create backend");

        let result = backend
            .acquire_lock("unit:lock", "t", Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::NotImplemented(_))));
    }
}
