//! Cache facade - main entry point for cache operations.

use crate::backend::{AnyBackend, InMemoryBackend, KeyValueBackend};
use crate::coalesce::CallGroup;
use crate::config::{CacheConfig, Driver, DEFAULT_NIL_TTL, DEFAULT_NIL_VALUE};
use crate::error::{Error, Result};
use crate::key::KeyPrefix;
use crate::lock::{Lock, LockConfig};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::payload::IntoPayload;
use crate::result::CacheResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a `get_set` producer came up with.
#[derive(Debug, Clone)]
pub enum Produced {
    /// A value to cache. `ttl: None` = never expires.
    Value {
        payload: Vec<u8>,
        ttl: Option<Duration>,
    },
    /// Nothing exists for this key. Caches the nil marker for `ttl`, or the
    /// facade's nil TTL when `None`, so repeated lookups skip the producer.
    NoData { ttl: Option<Duration> },
}

impl Produced {
    /// Cache `value` for `ttl`.
    ///
    /// # Errors
    /// Returns `Err` if the value fails to encode
    pub fn value(value: impl IntoPayload, ttl: Duration) -> Result<Self> {
        Ok(Produced::Value {
            payload: value.into_payload()?,
            ttl: Some(ttl),
        })
    }

    /// Cache `value` without expiry.
    ///
    /// # Errors
    /// Returns `Err` if the value fails to encode
    pub fn forever(value: impl IntoPayload) -> Result<Self> {
        Ok(Produced::Value {
            payload: value.into_payload()?,
            ttl: None,
        })
    }

    pub fn no_data() -> Self {
        Produced::NoData { ttl: None }
    }

    pub fn no_data_for(ttl: Duration) -> Self {
        Produced::NoData { ttl: Some(ttl) }
    }
}

/// Outcome shared with every caller of one coalesced fill.
#[derive(Debug, Clone)]
struct Filled {
    value: Option<Vec<u8>>,
    write_error: Option<Error>,
}

#[derive(Clone)]
struct Settings<B: KeyValueBackend> {
    backend: B,
    prefix: KeyPrefix,
    nil_value: Vec<u8>,
    nil_ttl: Duration,
    lock: LockConfig,
    metrics: Arc<dyn CacheMetrics>,
}

struct Inner<B: KeyValueBackend> {
    settings: Settings<B>,
    fills: CallGroup<Filled>,
    reads: CallGroup<Option<Vec<u8>>>,
    checks: CallGroup<bool>,
}

/// Cache facade over a [`KeyValueBackend`].
///
/// Applies the key prefix, encodes values, runs read-through fills with
/// request coalescing and negative caching, and hands out distributed locks.
/// Cheap to clone; clones share the backend and the in-flight registries.
///
/// # Example
///
/// ```
/// use lease_cache::{Cache, InMemoryBackend, Produced};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> lease_cache::Result<()> {
/// let cache = Cache::new(InMemoryBackend::new()).with_prefix("app");
///
/// let name = cache
///     .get_set("user:1:name", || async {
///         Produced::value("alice", Duration::from_secs(60))
///     })
///     .await;
/// assert_eq!(name.string()?, Some("alice".to_string()));
/// assert_eq!(cache.prefix_key("user:1:name"), "app:user:1:name");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Cache<B: KeyValueBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: KeyValueBackend> Cache<B> {
    /// Facade with no prefix, default nil marker and default lock tuning.
    pub fn new(backend: B) -> Self {
        Self::from_settings(Settings {
            backend,
            prefix: KeyPrefix::default(),
            nil_value: DEFAULT_NIL_VALUE.as_bytes().to_vec(),
            nil_ttl: DEFAULT_NIL_TTL,
            lock: LockConfig::default(),
            metrics: Arc::new(NoOpMetrics),
        })
    }

    /// Facade with the prefix, nil marker and lock tuning from `config`.
    pub fn from_config(backend: B, config: &CacheConfig) -> Self {
        Self::new(backend)
            .with_prefix(config.prefix.as_str())
            .with_nil_value(config.nil_value.as_str())
            .with_nil_ttl(config.nil_ttl)
            .with_lock_config(config.lock.clone())
    }

    fn from_settings(settings: Settings<B>) -> Self {
        Cache {
            inner: Arc::new(Inner {
                settings,
                fills: CallGroup::new(),
                reads: CallGroup::new(),
                checks: CallGroup::new(),
            }),
        }
    }

    // Builders run before the facade is shared, so fresh registries are fine.
    fn rebuild(self, f: impl FnOnce(&mut Settings<B>)) -> Self {
        let mut settings = self.inner.settings.clone();
        f(&mut settings);
        Self::from_settings(settings)
    }

    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        let prefix = KeyPrefix::new(prefix);
        self.rebuild(|s| s.prefix = prefix)
    }

    pub fn with_nil_value(self, nil_value: impl Into<String>) -> Self {
        let nil_value = nil_value.into().into_bytes();
        self.rebuild(|s| s.nil_value = nil_value)
    }

    pub fn with_nil_ttl(self, ttl: Duration) -> Self {
        self.rebuild(|s| s.nil_ttl = ttl)
    }

    pub fn with_lock_config(self, lock: LockConfig) -> Self {
        self.rebuild(|s| s.lock = lock)
    }

    /// Set custom metrics handler.
    pub fn with_metrics(self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.rebuild(|s| s.metrics = metrics)
    }

    /// The underlying backend client.
    pub fn backend(&self) -> &B {
        &self.inner.settings.backend
    }

    pub fn prefix(&self) -> &KeyPrefix {
        &self.inner.settings.prefix
    }

    /// Backend key for `key`: `"{prefix}:{key}"`, or `key` when unprefixed.
    pub fn prefix_key(&self, key: &str) -> String {
        self.inner.settings.prefix.apply(key)
    }

    /// Whether `key` exists. A cached nil marker counts as existing.
    ///
    /// Concurrent checks of the same key share one backend round-trip.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn has(&self, key: &str) -> Result<bool> {
        let s = &self.inner.settings;
        let full = s.prefix.apply(key);
        self.inner
            .checks
            .call(&full, || s.backend.exists(&full))
            .await
            .inspect_err(|e| s.metrics.record_error(&full, &e.to_string()))
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn has_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<HashMap<String, bool>> {
        let s = &self.inner.settings;
        let full = s.prefix.apply_all(keys);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        let found = s.backend.mexists(&refs).await?;

        Ok(keys
            .iter()
            .map(|k| k.as_ref().to_string())
            .zip(found)
            .collect())
    }

    /// Read `key`. A cached nil marker reads as absent.
    ///
    /// Concurrent reads of the same key share one backend round-trip.
    pub async fn get(&self, key: &str) -> CacheResult {
        let s = &self.inner.settings;
        let full = s.prefix.apply(key);
        let started = Instant::now();

        match self.inner.reads.call(&full, || s.backend.get(&full)).await {
            Ok(Some(bytes)) => self.classify_hit(&full, bytes, started),
            Ok(None) => {
                s.metrics.record_miss(&full, started.elapsed());
                CacheResult::absent()
            }
            Err(e) => {
                s.metrics.record_error(&full, &e.to_string());
                CacheResult::failed(e)
            }
        }
    }

    /// Read `key`, substituting `default` when absent. Nothing is written.
    pub async fn get_or(&self, key: &str, default: impl IntoPayload) -> CacheResult {
        let found = self.get(key).await;
        if !found.is_absent() {
            return found;
        }
        match default.into_payload() {
            Ok(bytes) => CacheResult::present(bytes),
            Err(e) => CacheResult::failed(e),
        }
    }

    /// Read several keys in one round-trip, keyed by the caller's keys.
    pub async fn get_many<S: AsRef<str>>(&self, keys: &[S]) -> HashMap<String, CacheResult> {
        let s = &self.inner.settings;
        let full = s.prefix.apply_all(keys);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        let started = Instant::now();

        match s.backend.mget(&refs).await {
            Ok(values) => keys
                .iter()
                .zip(full.iter())
                .zip(values)
                .map(|((key, full), value)| {
                    let result = match value {
                        Some(bytes) => self.classify_hit(full, bytes, started),
                        None => {
                            s.metrics.record_miss(full, started.elapsed());
                            CacheResult::absent()
                        }
                    };
                    (key.as_ref().to_string(), result)
                })
                .collect(),
            Err(e) => {
                s.metrics.record_error("(mget)", &e.to_string());
                keys.iter()
                    .map(|key| (key.as_ref().to_string(), CacheResult::failed(e.clone())))
                    .collect()
            }
        }
    }

    /// Read-through: return the cached value, or run `producer` once for all
    /// concurrent callers on this key, cache what it returns and hand it out.
    ///
    /// - hit → the value; a cached nil marker → absent, producer not run
    /// - [`Produced::Value`] → stored with its TTL, present
    /// - [`Produced::NoData`] → nil marker stored, absent
    /// - producer error → failed, nothing stored
    ///
    /// A failed write-back does not hide the value: it is reported through
    /// [`CacheResult::write_error`].
    pub async fn get_set<F, Fut>(&self, key: &str, producer: F) -> CacheResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Produced>>,
    {
        let s = &self.inner.settings;
        let full = s.prefix.apply(key);
        let started = Instant::now();

        match s.backend.get(&full).await {
            Ok(Some(bytes)) => return self.classify_hit(&full, bytes, started),
            Ok(None) => s.metrics.record_miss(&full, started.elapsed()),
            Err(e) => {
                s.metrics.record_error(&full, &e.to_string());
                return CacheResult::failed(e);
            }
        }

        match self
            .inner
            .fills
            .call(&full, || self.fill(&full, producer))
            .await
        {
            Ok(Filled {
                value: Some(bytes),
                write_error,
            }) => CacheResult::present(bytes).with_write_error(write_error),
            Ok(Filled {
                value: None,
                write_error,
            }) => CacheResult::absent().with_write_error(write_error),
            Err(e) => CacheResult::failed(e),
        }
    }

    async fn fill<F, Fut>(&self, full: &str, producer: F) -> Result<Filled>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Produced>>,
    {
        let s = &self.inner.settings;

        // A previous generation may have filled the key between our miss and
        // taking ownership.
        match s.backend.get(full).await {
            Ok(Some(bytes)) => {
                let value = (bytes != s.nil_value).then_some(bytes);
                return Ok(Filled {
                    value,
                    write_error: None,
                });
            }
            Ok(None) => {}
            Err(e) => {
                s.metrics.record_error(full, &e.to_string());
                return Err(e);
            }
        }

        let started = Instant::now();
        let produced = producer().await;
        s.metrics.record_produce(full, started.elapsed());

        let (value, payload, ttl) = match produced {
            Ok(Produced::Value { payload, ttl }) => (Some(payload.clone()), payload, ttl),
            Ok(Produced::NoData { ttl }) => {
                (None, s.nil_value.clone(), Some(ttl.unwrap_or(s.nil_ttl)))
            }
            Err(e) => {
                s.metrics.record_error(full, &e.to_string());
                return Err(e);
            }
        };

        let write_error = match self.write(full, payload, ttl).await {
            Ok(()) => None,
            Err(e) => {
                warn!("⚠ read-through write-back failed for {}: {}", full, e);
                Some(e)
            }
        };
        Ok(Filled { value, write_error })
    }

    /// Store `value` under `key` for `ttl`.
    ///
    /// # Errors
    /// Returns `Err` if encoding fails or backend error occurs
    pub async fn set(&self, key: &str, value: impl IntoPayload, ttl: Duration) -> Result<()> {
        let payload = value.into_payload()?;
        self.write(&self.prefix_key(key), payload, Some(ttl)).await
    }

    /// Store `value` under `key` without expiry.
    ///
    /// # Errors
    /// Returns `Err` if encoding fails or backend error occurs
    pub async fn forever(&self, key: &str, value: impl IntoPayload) -> Result<()> {
        let payload = value.into_payload()?;
        self.write(&self.prefix_key(key), payload, None).await
    }

    /// # Errors
    /// Returns `Err` if any value fails to encode (nothing is written) or
    /// backend error occurs
    pub async fn set_many<K, V>(
        &self,
        entries: impl IntoIterator<Item = (K, V)>,
        ttl: Duration,
    ) -> Result<()>
    where
        K: AsRef<str>,
        V: IntoPayload,
    {
        let encoded = self.encode_all(entries)?;
        self.write_many(encoded, Some(ttl)).await
    }

    /// # Errors
    /// Returns `Err` if any value fails to encode (nothing is written) or
    /// backend error occurs
    pub async fn forever_many<K, V>(&self, entries: impl IntoIterator<Item = (K, V)>) -> Result<()>
    where
        K: AsRef<str>,
        V: IntoPayload,
    {
        let encoded = self.encode_all(entries)?;
        self.write_many(encoded, None).await
    }

    /// Store only if `key` is absent. `ttl: None` = never expires.
    ///
    /// # Errors
    /// Returns `Err` if encoding fails or backend error occurs
    pub async fn add(
        &self,
        key: &str,
        value: impl IntoPayload,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let s = &self.inner.settings;
        let payload = value.into_payload()?;
        let full = s.prefix.apply(key);
        let started = Instant::now();

        let stored = s.backend.add(&full, payload, ttl).await?;
        if stored {
            s.metrics.record_set(&full, started.elapsed());
        }
        Ok(stored)
    }

    /// Add `by` to the integer at `key` (created at 0). Returns the new value.
    ///
    /// # Errors
    /// Returns `Err` if the stored value is not an integer or backend error occurs
    pub async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let s = &self.inner.settings;
        s.backend.incr_by(&s.prefix.apply(key), by).await
    }

    /// # Errors
    /// Returns `Err` if the stored value is not an integer or backend error occurs
    pub async fn decrement(&self, key: &str, by: i64) -> Result<i64> {
        self.increment(key, negate(key, by)?).await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn increment_many(&self, entries: &[(&str, i64)]) -> Result<HashMap<String, i64>> {
        let s = &self.inner.settings;
        let full: Vec<String> = entries.iter().map(|(k, _)| s.prefix.apply(k)).collect();
        let pairs: Vec<(&str, i64)> = full
            .iter()
            .zip(entries)
            .map(|(f, (_, by))| (f.as_str(), *by))
            .collect();
        let values = s.backend.mincr_by(&pairs).await?;

        Ok(entries
            .iter()
            .map(|(k, _)| k.to_string())
            .zip(values)
            .collect())
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn decrement_many(&self, entries: &[(&str, i64)]) -> Result<HashMap<String, i64>> {
        let negated = entries
            .iter()
            .map(|(k, by)| Ok((*k, negate(k, *by)?)))
            .collect::<Result<Vec<(&str, i64)>>>()?;
        self.increment_many(&negated).await
    }

    /// Remove `key`. Returns whether something was removed.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn forget(&self, key: &str) -> Result<bool> {
        let s = &self.inner.settings;
        let full = s.prefix.apply(key);
        let started = Instant::now();

        let removed = s.backend.delete(&full).await?;
        s.metrics.record_delete(&full, started.elapsed());
        Ok(removed)
    }

    /// Remove several keys. Returns how many were removed.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn forget_many<S: AsRef<str>>(&self, keys: &[S]) -> Result<u64> {
        let s = &self.inner.settings;
        let full = s.prefix.apply_all(keys);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        s.backend.mdelete(&refs).await
    }

    /// Give `key` a new TTL. Returns `false` if the key is absent.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let s = &self.inner.settings;
        s.backend.expire(&s.prefix.apply(key), ttl).await
    }

    /// # Errors
    /// Returns `Err` if backend error occurs
    pub async fn expire_many(
        &self,
        entries: &[(&str, Duration)],
    ) -> Result<HashMap<String, bool>> {
        let s = &self.inner.settings;
        let full: Vec<String> = entries.iter().map(|(k, _)| s.prefix.apply(k)).collect();
        let pairs: Vec<(&str, Duration)> = full
            .iter()
            .zip(entries)
            .map(|(f, (_, ttl))| (f.as_str(), *ttl))
            .collect();
        let updated = s.backend.mexpire(&pairs).await?;

        Ok(entries
            .iter()
            .map(|(k, _)| k.to_string())
            .zip(updated)
            .collect())
    }

    /// Remove every entry under this facade's prefix, or the whole store when
    /// there is no prefix. Lock entries under the prefix go too.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs or the backend cannot clear
    pub async fn flush(&self) -> Result<()> {
        let s = &self.inner.settings;
        if s.prefix.is_empty() {
            s.backend.clear_all().await
        } else {
            let removed = s.backend.clear_namespace(&s.prefix.namespace()).await?;
            info!("✓ flushed {} entries under {}", removed, s.prefix.as_str());
            Ok(())
        }
    }

    /// Lock on `name` (prefixed like any key) with this facade's lock tuning.
    ///
    /// Building the handle never fails. On a backend without lock support
    /// (Memcached) the first `acquire` returns `Error::NotImplemented`.
    pub fn lock(&self, name: &str, lease: Duration) -> Lock<B> {
        self.lock_with(name, lease, self.inner.settings.lock.clone())
    }

    pub fn lock_with(&self, name: &str, lease: Duration, config: LockConfig) -> Lock<B> {
        let s = &self.inner.settings;
        Lock::with_config(s.backend.clone(), s.prefix.apply(name), lease, config)
    }

    /// Run `critical` while holding the lock `name`.
    ///
    /// # Returns
    /// - `Ok(Some(value))` - Ran and released cleanly
    /// - `Ok(None)` - Lock stayed contended; `critical` did not run
    ///
    /// # Errors
    /// - `critical`'s own error (the lock is released first)
    /// - `Error::LockLost` if the lease lapsed before release
    /// - Backend errors from acquiring or releasing
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        lease: Duration,
        critical: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let s = &self.inner.settings;
        let mut lock = self.lock(name, lease);
        let started = Instant::now();

        let acquired = match lock.acquire().await {
            Ok(acquired) => acquired,
            Err(e) => {
                s.metrics.record_error(lock.name(), &e.to_string());
                return Err(e);
            }
        };
        s.metrics.record_lock(lock.name(), acquired, started.elapsed());
        if !acquired {
            return Ok(None);
        }

        let outcome = critical().await;
        let released = lock.release().await;
        let value = outcome?;

        if !released? {
            s.metrics.record_error(lock.name(), "lock lost before release");
            return Err(Error::LockLost(lock.name().to_string()));
        }
        Ok(Some(value))
    }

    /// Health check - verify backend is accessible.
    ///
    /// # Errors
    /// Returns `Err` if backend is not accessible
    pub async fn health_check(&self) -> Result<bool> {
        self.inner.settings.backend.health_check().await
    }

    fn classify_hit(&self, full: &str, bytes: Vec<u8>, started: Instant) -> CacheResult {
        let s = &self.inner.settings;
        if bytes == s.nil_value {
            s.metrics.record_negative_hit(full, started.elapsed());
            CacheResult::absent()
        } else {
            s.metrics.record_hit(full, started.elapsed());
            CacheResult::present(bytes)
        }
    }

    async fn write(&self, full: &str, payload: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let s = &self.inner.settings;
        let started = Instant::now();

        s.backend
            .set(full, payload, ttl)
            .await
            .inspect_err(|e| s.metrics.record_error(full, &e.to_string()))?;
        s.metrics.record_set(full, started.elapsed());
        Ok(())
    }

    fn encode_all<K, V>(
        &self,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Vec<(String, Vec<u8>)>>
    where
        K: AsRef<str>,
        V: IntoPayload,
    {
        entries
            .into_iter()
            .map(|(k, v)| Ok((self.prefix_key(k.as_ref()), v.into_payload()?)))
            .collect()
    }

    async fn write_many(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        let s = &self.inner.settings;
        let started = Instant::now();
        let count = entries.len();

        s.backend.mset(entries, ttl).await?;
        debug!("✓ stored {} entries in {:?}", count, started.elapsed());
        Ok(())
    }
}

impl Cache<AnyBackend> {
    /// Connect to the driver named in `config` and wrap it in a facade.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for invalid settings or a driver this
    /// build was compiled without, or a backend error from pool creation
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let backend = match config.driver {
            Driver::InMemory => AnyBackend::from(InMemoryBackend::new()),
            Driver::Redis => connect_redis(&config).await?,
            Driver::Memcached => connect_memcached(&config).await?,
        };

        info!(
            "✓ cache facade ready (driver: {}, prefix: {:?})",
            backend.driver_name(),
            config.prefix
        );
        Ok(Cache::from_config(backend, &config))
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &CacheConfig) -> Result<AnyBackend> {
    use crate::backend::RedisBackend;

    let backend = match &config.redis_url {
        Some(url) => RedisBackend::from_connection_string(url).await?,
        None => RedisBackend::new(config.redis.clone()).await?,
    };
    Ok(backend.into())
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &CacheConfig) -> Result<AnyBackend> {
    Err(Error::ConfigError(
        "redis driver requested but the `redis` feature is disabled".to_string(),
    ))
}

#[cfg(feature = "memcached")]
async fn connect_memcached(config: &CacheConfig) -> Result<AnyBackend> {
    use crate::backend::MemcachedBackend;

    let backend = MemcachedBackend::new(config.memcached.clone()).await?;
    Ok(backend.into())
}

#[cfg(not(feature = "memcached"))]
async fn connect_memcached(_config: &CacheConfig) -> Result<AnyBackend> {
    Err(Error::ConfigError(
        "memcached driver requested but the `memcached` feature is disabled".to_string(),
    ))
}

fn negate(key: &str, by: i64) -> Result<i64> {
    by.checked_neg().ok_or_else(|| {
        Error::BackendError(format!("decrement by {} would overflow for key {}", by, key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose writes always fail.
    #[derive(Clone, Default)]
    struct ReadOnlyBackend(InMemoryBackend);

    impl KeyValueBackend for ReadOnlyBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
            Err(Error::BackendError(format!("read-only: {}", key)))
        }

        async fn add(&self, key: &str, _value: Vec<u8>, _ttl: Option<Duration>) -> Result<bool> {
            Err(Error::BackendError(format!("read-only: {}", key)))
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.0.delete(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.0.expire(key, ttl).await
        }

        async fn incr_by(&self, key: &str, _delta: i64) -> Result<i64> {
            Err(Error::BackendError(format!("read-only: {}", key)))
        }
    }

    /// Backend whose reads start failing after `reads_left` successful ones.
    #[derive(Clone)]
    struct FailingReads {
        inner: InMemoryBackend,
        reads_left: Arc<AtomicUsize>,
    }

    impl FailingReads {
        fn after(reads: usize) -> Self {
            FailingReads {
                inner: InMemoryBackend::new(),
                reads_left: Arc::new(AtomicUsize::new(reads)),
            }
        }
    }

    impl KeyValueBackend for FailingReads {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let readable = self
                .reads_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !readable {
                return Err(Error::BackendError(format!("connection reset reading {}", key)));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
            self.inner.add(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.inner.expire(key, ttl).await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
            self.inner.incr_by(key, delta).await
        }
    }

    #[derive(Default)]
    struct CountingMetrics {
        hits: AtomicUsize,
        negative_hits: AtomicUsize,
        misses: AtomicUsize,
        produces: AtomicUsize,
    }

    impl CacheMetrics for CountingMetrics {
        fn record_hit(&self, _key: &str, _duration: Duration) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
        fn record_negative_hit(&self, _key: &str, _duration: Duration) {
            self.negative_hits.fetch_add(1, Ordering::SeqCst);
        }
        fn record_miss(&self, _key: &str, _duration: Duration) {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }
        fn record_produce(&self, _key: &str, _duration: Duration) {
            self.produces.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_prefix_key() {
        let plain = Cache::new(InMemoryBackend::new());
        assert_eq!(plain.prefix_key("user:1"), "user:1");

        let prefixed = plain.with_prefix("app");
        assert_eq!(prefixed.prefix_key("user:1"), "app:user:1");
    }

    #[tokio::test]
    async fn test_set_writes_prefixed_key() {
        let backend = InMemoryBackend::new();
        let cache = Cache::new(backend.clone()).with_prefix("app");

        cache.set("name", "alice", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("app:name").await.unwrap(), Some(b"alice".to_vec()));
        assert_eq!(cache.get("name").await.string().unwrap(), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_get_set_produces_once_then_hits() {
        let metrics = Arc::new(CountingMetrics::default());
        let cache = Cache::new(InMemoryBackend::new()).with_metrics(metrics.clone());
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_set("name", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Produced::value("alice", Duration::from_secs(60))
                })
                .await;
            assert_eq!(result.val().unwrap(), "alice");
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.produces.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_data_is_negatively_cached() {
        let backend = InMemoryBackend::new();
        let metrics = Arc::new(CountingMetrics::default());
        let cache = Cache::new(backend.clone()).with_metrics(metrics.clone());
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_set("ghost", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(Produced::no_data())
                })
                .await;
            assert!(result.is_absent());
            assert!(result.write_error().is_none());
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.negative_hits.load(Ordering::SeqCst), 2);
        assert_eq!(backend.get("ghost").await.unwrap(), Some(b"cache@nil".to_vec()));
        assert!(backend.ttl("ghost").is_some());

        // the marker is absent to plain reads as well
        assert!(cache.get("ghost").await.is_absent());
        assert!(cache.has("ghost").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nil_marker_uses_configured_ttl() {
        let backend = InMemoryBackend::new();
        let cache = Cache::new(backend.clone()).with_nil_ttl(Duration::from_secs(2));

        cache.get_set("ghost", || async { Ok(Produced::no_data()) }).await;
        assert!(backend.exists("ghost").await.unwrap());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!backend.exists("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_producer_error_is_not_cached() {
        let backend = InMemoryBackend::new();
        let cache = Cache::new(backend.clone());

        let failed = cache
            .get_set("flaky", || async { Err(Error::producer("db down")) })
            .await;
        assert!(matches!(failed.err(), Some(Error::Producer(_))));
        assert!(!backend.exists("flaky").await.unwrap());

        let recovered = cache
            .get_set("flaky", || async { Produced::forever(7i64) })
            .await;
        assert_eq!(recovered.i64().unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_write_back_failure_keeps_value() {
        let cache = Cache::new(ReadOnlyBackend::default());

        let result = cache
            .get_set("name", || async {
                Produced::value("alice", Duration::from_secs(60))
            })
            .await;
        assert_eq!(result.string().unwrap(), Some("alice".to_string()));
        assert!(matches!(result.write_error(), Some(Error::BackendError(_))));
    }

    #[tokio::test]
    async fn test_custom_nil_value() {
        let backend = InMemoryBackend::new();
        let cache = Cache::new(backend.clone()).with_nil_value("∅");

        backend.set("plain", b"cache@nil".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("plain").await.val().unwrap(), "cache@nil");

        backend.set("nil", "∅".as_bytes().to_vec(), None).await.unwrap();
        assert!(cache.get("nil").await.is_absent());
    }

    #[tokio::test]
    async fn test_get_or_and_get_many() {
        let cache = Cache::new(InMemoryBackend::new()).with_prefix("t");
        cache.forever("a", 1i64).await.unwrap();
        cache.forever("b", "two").await.unwrap();

        assert_eq!(cache.get_or("missing", 5u8).await.u64().unwrap(), Some(5));
        assert_eq!(cache.get_or("a", 5u8).await.i64().unwrap(), Some(1));

        let found = cache.get_many(&["a", "b", "c"]).await;
        assert_eq!(found.len(), 3);
        assert_eq!(found["a"].i64().unwrap(), Some(1));
        assert_eq!(found["b"].val().unwrap(), "two");
        assert!(found["c"].is_absent());
    }

    #[tokio::test]
    async fn test_bulk_passthroughs() {
        let cache = Cache::new(InMemoryBackend::new()).with_prefix("bulk");
        cache
            .set_many(vec![("x", 1i64), ("y", 2i64)], Duration::from_secs(60))
            .await
            .unwrap();

        let present = cache.has_many(&["x", "y", "z"]).await.unwrap();
        assert!(present["x"]);
        assert!(!present["z"]);

        let counts = cache.increment_many(&[("x", 10), ("z", 3)]).await.unwrap();
        assert_eq!(counts["x"], 11);
        assert_eq!(counts["z"], 3);

        let counts = cache.decrement_many(&[("y", 2)]).await.unwrap();
        assert_eq!(counts["y"], 0);

        let expired = cache
            .expire_many(&[("x", Duration::from_secs(5)), ("nope", Duration::from_secs(5))])
            .await
            .unwrap();
        assert!(expired["x"]);
        assert!(!expired["nope"]);

        assert_eq!(cache.forget_many(&["x", "y", "nope"]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fill_recheck_error_skips_producer() {
        // the miss read succeeds, the re-read under fill ownership fails
        let backend = FailingReads::after(1);
        let cache = Cache::new(backend.clone());
        let calls = AtomicUsize::new(0);

        let result = cache
            .get_set("user:1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Produced::value("alice", Duration::from_secs(60))
            })
            .await;

        assert!(matches!(result.err(), Some(Error::BackendError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!backend.inner.exists("user:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_decrement_by_min_overflows() {
        let cache = Cache::new(InMemoryBackend::new());
        cache.increment("n", 5).await.unwrap();

        assert!(matches!(
            cache.decrement("n", i64::MIN).await,
            Err(Error::BackendError(_))
        ));
        assert!(matches!(
            cache.decrement_many(&[("n", 1), ("m", i64::MIN)]).await,
            Err(Error::BackendError(_))
        ));
        assert_eq!(cache.get("n").await.i64().unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_add_increment_forget() {
        let cache = Cache::new(InMemoryBackend::new());

        assert!(cache.add("once", "first", None).await.unwrap());
        assert!(!cache.add("once", "second", None).await.unwrap());
        assert_eq!(cache.get("once").await.val().unwrap(), "first");

        assert_eq!(cache.increment("hits", 1).await.unwrap(), 1);
        assert_eq!(cache.increment("hits", 4).await.unwrap(), 5);
        assert_eq!(cache.decrement("hits", 2).await.unwrap(), 3);

        assert!(cache.forget("hits").await.unwrap());
        assert!(!cache.forget("hits").await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_only_touches_prefix() {
        let backend = InMemoryBackend::new();
        let app = Cache::new(backend.clone()).with_prefix("app");
        let other = Cache::new(backend.clone()).with_prefix("other");

        app.forever("a", "1").await.unwrap();
        app.forever("b", "2").await.unwrap();
        other.forever("a", "3").await.unwrap();

        app.flush().await.unwrap();
        assert!(app.get("a").await.is_absent());
        assert!(app.get("b").await.is_absent());
        assert_eq!(other.get("a").await.val().unwrap(), "3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_runs_and_releases() {
        let backend = InMemoryBackend::new();
        let cache = Cache::new(backend.clone()).with_prefix("app");

        let out = cache
            .with_lock("job:1", Duration::from_secs(5), || async {
                Ok::<_, Error>(42)
            })
            .await
            .unwrap();
        assert_eq!(out, Some(42));
        assert!(!backend.exists("app:job:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_reports_lost_lease() {
        let cache = Cache::new(InMemoryBackend::new()).with_lock_config(
            LockConfig::default().with_renewal(crate::lock::RenewalPolicy::Bounded(0)),
        );

        let out = cache
            .with_lock("slow", Duration::from_secs(1), || async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok::<_, Error>(())
            })
            .await;
        assert!(matches!(out, Err(Error::LockLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_lock_contended_skips_critical_section() {
        let cache = Cache::new(InMemoryBackend::new());
        let mut holder = cache.lock("busy", Duration::from_secs(1));
        assert!(holder.acquire().await.unwrap());

        let ran = AtomicUsize::new(0);
        let out = cache
            .with_lock("busy", Duration::from_secs(1), || async {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(holder.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_inmemory() {
        let cache = Cache::connect(CacheConfig::default().with_prefix("svc"))
            .await
            .unwrap();
        assert_eq!(cache.backend().driver_name(), "inmemory");
        assert_eq!(cache.prefix_key("k"), "svc:k");
        assert!(cache.health_check().await.unwrap());
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_connect_missing_feature() {
        let result = Cache::connect(CacheConfig::default().with_driver(Driver::Redis)).await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}
