//! Facade configuration and runtime driver selection.

use crate::error::{Error, Result};
use crate::lock::LockConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "memcached")]
use crate::backend::MemcachedConfig;
#[cfg(feature = "redis")]
use crate::backend::RedisConfig;

/// Marker stored for keys whose producer reported "no data".
pub const DEFAULT_NIL_VALUE: &str = "cache@nil";

/// How long a "no data" marker lives when the producer gives no TTL.
pub const DEFAULT_NIL_TTL: Duration = Duration::from_secs(10);

/// Which backing store to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Driver {
    #[default]
    InMemory,
    Redis,
    Memcached,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::InMemory => "inmemory",
            Driver::Redis => "redis",
            Driver::Memcached => "memcached",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inmemory" | "in-memory" | "memory" => Ok(Driver::InMemory),
            "redis" => Ok(Driver::Redis),
            "memcached" | "memcache" => Ok(Driver::Memcached),
            other => Err(Error::ConfigError(format!("unknown cache driver: {}", other))),
        }
    }
}

/// Settings for [`Cache::connect`](crate::Cache::connect).
///
/// # Environment Variables
/// - `CACHE_DRIVER`: `inmemory` (default), `redis` or `memcached`
/// - `CACHE_PREFIX`: key prefix, empty by default
/// - `CACHE_NIL_VALUE`: "no data" marker (default `cache@nil`)
/// - `CACHE_NIL_TTL_SECS`: marker lifetime in seconds (default 10)
/// - `REDIS_URL`: full connection string; otherwise `REDIS_HOST`, `REDIS_PORT`, ...
/// - `MEMCACHED_SERVERS`, `MEMCACHED_POOL_SIZE`
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub driver: Driver,
    pub prefix: String,
    pub nil_value: String,
    pub nil_ttl: Duration,
    pub lock: LockConfig,
    /// Takes precedence over `redis` when set.
    pub redis_url: Option<String>,
    #[cfg(feature = "redis")]
    pub redis: RedisConfig,
    #[cfg(feature = "memcached")]
    pub memcached: MemcachedConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            driver: Driver::default(),
            prefix: String::new(),
            nil_value: DEFAULT_NIL_VALUE.to_string(),
            nil_ttl: DEFAULT_NIL_TTL,
            lock: LockConfig::default(),
            redis_url: None,
            #[cfg(feature = "redis")]
            redis: RedisConfig::default(),
            #[cfg(feature = "memcached")]
            memcached: MemcachedConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for an unknown driver or a malformed number
    pub fn from_env() -> Result<Self> {
        let mut config = CacheConfig::default();

        if let Ok(driver) = std::env::var("CACHE_DRIVER") {
            config.driver = driver.parse()?;
        }
        if let Ok(prefix) = std::env::var("CACHE_PREFIX") {
            config.prefix = prefix;
        }
        if let Ok(nil_value) = std::env::var("CACHE_NIL_VALUE") {
            config.nil_value = nil_value;
        }
        if let Ok(secs) = std::env::var("CACHE_NIL_TTL_SECS") {
            let secs = secs.trim().parse::<u64>().map_err(|e| {
                Error::ConfigError(format!("CACHE_NIL_TTL_SECS={:?}: {}", secs, e))
            })?;
            config.nil_ttl = Duration::from_secs(secs);
        }
        config.redis_url = std::env::var("REDIS_URL").ok();

        #[cfg(feature = "redis")]
        {
            config.redis = RedisConfig::from_env();
        }
        #[cfg(feature = "memcached")]
        {
            config.memcached = MemcachedConfig::from_env();
        }

        Ok(config)
    }

    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_nil_value(mut self, nil_value: impl Into<String>) -> Self {
        self.nil_value = nil_value.into();
        self
    }

    pub fn with_nil_ttl(mut self, ttl: Duration) -> Self {
        self.nil_ttl = ttl;
        self
    }

    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Reject settings the facade cannot work with.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.nil_value.is_empty() {
            return Err(Error::ConfigError(
                "nil value must not be empty".to_string(),
            ));
        }
        if self.nil_ttl.is_zero() {
            return Err(Error::ConfigError("nil TTL must be positive".to_string()));
        }
        if self.lock.poll_interval.is_zero() {
            return Err(Error::ConfigError(
                "lock poll interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
