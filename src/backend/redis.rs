//! Redis backend implementation.
//!
//! Plain commands go straight through the pool. The lock primitives run as
//! Lua scripts (acquire-or-refresh, renew-if-owned, release-if-owned) invoked
//! by SHA through a [`ScriptRegistry`] owned by the backend. When Redis has
//! forgotten a script (`NOSCRIPT`, e.g. after `SCRIPT FLUSH` or a failover),
//! the call fails with [`Error::ScriptNotLoaded`] and the registry reloads the
//! script in the background; it never retries the failed call itself.

use super::{lease_millis, KeyValueBackend};
use crate::error::{Error, Result};
use crate::task::{spawn_supervised, Supervised};
use dashmap::DashMap;
use deadpool_redis::{
    redis::{self, AsyncCommands, RedisError},
    Config as PoolConfig, Connection, Pool, Runtime,
};
use std::sync::Arc;
use std::time::Duration;

/// Pool statistics information.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Default Redis connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Keys fetched per SCAN round when clearing a namespace.
const SCAN_BATCH: usize = 500;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        if let Some(password) = &self.password {
            if let Some(username) = &self.username {
                format!(
                    "redis://{}:{}@{}:{}/{}",
                    username, password, self.host, self.port, self.database
                )
            } else {
                format!(
                    "redis://default:{}@{}:{}/{}",
                    password, self.host, self.port, self.database
                )
            }
        } else {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        }
    }

    /// Read configuration from the environment, falling back to defaults.
    ///
    /// # Environment Variables
    /// - `REDIS_HOST`, `REDIS_PORT`, `REDIS_USERNAME`, `REDIS_PASSWORD`, `REDIS_DB`
    /// - `REDIS_POOL_SIZE`: connection pool size (default: 16)
    pub fn from_env() -> Self {
        let defaults = RedisConfig::default();
        RedisConfig {
            host: std::env::var("REDIS_HOST").unwrap_or(defaults.host),
            port: env_parse("REDIS_PORT").unwrap_or(defaults.port),
            username: std::env::var("REDIS_USERNAME").ok(),
            password: std::env::var("REDIS_PASSWORD").ok(),
            database: env_parse("REDIS_DB").unwrap_or(defaults.database),
            pool_size: env_parse("REDIS_POOL_SIZE").unwrap_or(defaults.pool_size),
            connection_timeout: defaults.connection_timeout,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

// ============================================================================
// Lock scripts
// ============================================================================

/// Set if absent, or refresh the TTL when already owned by this token.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2], 'NX') then
    return 1
end
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Extend the TTL only while the stored token matches.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Delete only while the stored token matches.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// The atomic scripts the lock relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockScript {
    Acquire,
    Renew,
    Release,
}

impl LockScript {
    pub const ALL: [LockScript; 3] = [LockScript::Acquire, LockScript::Renew, LockScript::Release];

    pub fn source(self) -> &'static str {
        match self {
            LockScript::Acquire => ACQUIRE_SCRIPT,
            LockScript::Renew => RENEW_SCRIPT,
            LockScript::Release => RELEASE_SCRIPT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LockScript::Acquire => "acquire",
            LockScript::Renew => "renew",
            LockScript::Release => "release",
        }
    }
}

/// SHA handles of the lock scripts registered on one Redis deployment.
///
/// One registry per backend (clones of a backend share it), so several
/// backends pointing at different servers never mix up handles.
#[derive(Default)]
pub struct ScriptRegistry {
    shas: DashMap<LockScript, String>,
    reloads: DashMap<LockScript, Supervised<Result<String>>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently known SHA for `script`.
    pub fn sha(&self, script: LockScript) -> Option<String> {
        self.shas.get(&script).map(|s| s.clone())
    }

    /// Drop a handle the server no longer recognises.
    pub fn forget(&self, script: LockScript) {
        self.shas.remove(&script);
    }

    /// Register `script` with `SCRIPT LOAD` and remember its SHA.
    ///
    /// # Errors
    /// Returns `Err` if the server rejects the script or the connection fails
    pub async fn load(&self, conn: &mut Connection, script: LockScript) -> Result<String> {
        let sha: String = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script.source())
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Redis SCRIPT LOAD ({}) failed: {}", script.name(), e))
            })?;

        debug!("✓ Redis SCRIPT LOAD {} -> {}", script.name(), sha);
        self.shas.insert(script, sha.clone());
        Ok(sha)
    }

    /// Reload `script` on a background task, unless a reload is already running.
    fn schedule_reload(self: &Arc<Self>, pool: Pool, script: LockScript) {
        if let Some(mut previous) = self.reloads.get_mut(&script) {
            match previous.try_join() {
                None if !previous.is_finished() => return,
                Some(Err(e)) => warn!("⚠ previous {} script reload failed: {}", script.name(), e),
                Some(Ok(Err(e))) => warn!("⚠ previous {} script reload failed: {}", script.name(), e),
                _ => {}
            }
        }

        let registry = Arc::clone(self);
        let task = spawn_supervised(format!("redis-script-reload:{}", script.name()), async move {
            let mut conn = pool.get().await.map_err(|e| {
                Error::BackendError(format!("Failed to get Redis connection: {}", e))
            })?;
            let outcome = registry.load(&mut conn, script).await;
            if let Err(e) = &outcome {
                warn!("⚠ Redis {} script reload failed: {}", script.name(), e);
            }
            outcome
        });
        self.reloads.insert(script, task);
    }

    /// Run `script` by SHA with one key and the given arguments.
    ///
    /// A missing handle is loaded first. A `NOSCRIPT` reply fails this call
    /// and schedules a background reload.
    async fn eval(
        self: &Arc<Self>,
        pool: &Pool,
        script: LockScript,
        key: &str,
        args: &[&str],
    ) -> Result<i64> {
        let mut conn = pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))?;

        let sha = match self.sha(script) {
            Some(sha) => sha,
            None => self.load(&mut conn, script).await?,
        };

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&sha).arg(1).arg(key);
        for arg in args {
            cmd.arg(*arg);
        }

        match cmd.query_async::<i64>(&mut *conn).await {
            Ok(reply) => Ok(reply),
            Err(e) if is_noscript(&e) => {
                warn!(
                    "⚠ Redis forgot the {} script; reloading in background",
                    script.name()
                );
                self.forget(script);
                self.schedule_reload(pool.clone(), script);
                Err(Error::ScriptNotLoaded(format!(
                    "{} script ({}) for key {}",
                    script.name(),
                    sha,
                    key
                )))
            }
            Err(e) => Err(Error::BackendError(format!(
                "Redis EVALSHA ({}) failed for key {}: {}",
                script.name(),
                key,
                e
            ))),
        }
    }
}

fn is_noscript(e: &RedisError) -> bool {
    e.code() == Some("NOSCRIPT")
}

/// Escape glob metacharacters so a namespace matches literally in SCAN.
fn scan_pattern(namespace: &str) -> String {
    let mut pattern = String::with_capacity(namespace.len() + 1);
    for c in namespace.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

// ============================================================================
// Backend
// ============================================================================

/// Redis backend with connection pooling and async operations.
///
/// Uses deadpool for efficient async resource management and pooling.
///
/// # Example
///
/// ```no_run
/// # use lease_cache::backend::{RedisBackend, RedisConfig, KeyValueBackend};
/// # use lease_cache::error::Result;
/// # async fn example() -> Result<()> {
/// let config = RedisConfig::default();
/// let backend = RedisBackend::new(config).await?;
///
/// backend.set("key", b"value".to_vec(), None).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    scripts: Arc<ScriptRegistry>,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let backend = Self::with_pool_size(&config.connection_string(), config.pool_size)?;

        info!(
            "✓ Redis backend initialized: {}:{}",
            config.host, config.port
        );

        Ok(backend)
    }

    /// Create from connection string directly.
    ///
    /// Pool size is determined by:
    /// 1. `REDIS_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn from_connection_string(conn_str: &str) -> Result<Self> {
        let pool_size = env_parse("REDIS_POOL_SIZE").unwrap_or(DEFAULT_POOL_SIZE);
        let backend = Self::with_pool_size(conn_str, pool_size)?;

        info!(
            "✓ Redis backend initialized from connection string (pool size: {})",
            pool_size
        );

        Ok(backend)
    }

    fn with_pool_size(conn_str: &str, pool_size: u32) -> Result<Self> {
        let mut cfg = PoolConfig::from_url(conn_str);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size as usize));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::ConfigError(format!("Failed to create Redis pool: {}", e)))?;

        Ok(RedisBackend {
            pool,
            scripts: Arc::new(ScriptRegistry::new()),
        })
    }

    /// Register all lock scripts up front instead of on first use.
    ///
    /// # Errors
    /// Returns `Err` if any script fails to load
    pub async fn load_scripts(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        for script in LockScript::ALL {
            self.scripts.load(&mut conn, script).await?;
        }
        Ok(())
    }

    /// Script handles owned by this backend.
    pub fn scripts(&self) -> &Arc<ScriptRegistry> {
        &self.scripts
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            connections: status.size as u32,
            idle_connections: status.available as u32,
        }
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

impl KeyValueBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;

        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for key {}: {}", key, e)))?;

        if value.is_some() {
            debug!("✓ Redis GET {} -> HIT", key);
        } else {
            debug!("✓ Redis GET {} -> MISS", key);
        }

        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(d) = ttl {
            cmd.arg("PX").arg(lease_millis(d));
        }

        cmd.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET failed for key {}: {}", key, e)))?;

        match ttl {
            Some(d) => debug!("✓ Redis SET {} (TTL: {:?})", key, d),
            None => debug!("✓ Redis SET {}", key),
        }
        Ok(())
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(d) = ttl {
            cmd.arg("PX").arg(lease_millis(d));
        }

        let reply: Option<String> = cmd
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET NX failed for key {}: {}", key, e)))?;

        let stored = reply.is_some();
        debug!("✓ Redis SET NX {} -> {}", key, stored);
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL failed for key {}: {}", key, e)))?;

        debug!("✓ Redis DELETE {}", key);
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection().await?;

        let exists: bool = conn.exists(key).await.map_err(|e| {
            Error::BackendError(format!("Redis EXISTS failed for key {}: {}", key, e))
        })?;

        Ok(exists)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(lease_millis(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Redis PEXPIRE failed for key {}: {}", key, e))
            })?;

        debug!("✓ Redis PEXPIRE {} ({:?}) -> {}", key, ttl, updated);
        Ok(updated == 1)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.connection().await?;

        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Redis INCRBY failed for key {}: {}", key, e))
            })?;

        debug!("✓ Redis INCRBY {} {} -> {}", key, delta, value);
        Ok(value)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;

        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis MGET failed: {}", e)))?;

        debug!("✓ Redis MGET {} keys", keys.len());
        Ok(values)
    }

    async fn mexists(&self, keys: &[&str]) -> Result<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("EXISTS").arg(*key);
        }

        let replies: Vec<i64> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis EXISTS (bulk) failed: {}", e)))?;

        debug!("✓ Redis MEXISTS {} keys", keys.len());
        Ok(replies.into_iter().map(|n| n > 0).collect())
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let count = entries.len();
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(d) = ttl {
                cmd.arg("PX").arg(lease_millis(d));
            }
            cmd.ignore();
        }

        pipe.query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET (bulk) failed: {}", e)))?;

        debug!("✓ Redis MSET {} keys", count);
        Ok(())
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection().await?;

        let removed: u64 = conn
            .del(keys)
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL (bulk) failed: {}", e)))?;

        debug!("✓ Redis MDELETE {} keys ({} removed)", keys.len(), removed);
        Ok(removed)
    }

    async fn mexpire(&self, entries: &[(&str, Duration)]) -> Result<Vec<bool>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, ttl) in entries {
            pipe.cmd("PEXPIRE").arg(*key).arg(lease_millis(*ttl));
        }

        let replies: Vec<i64> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis PEXPIRE (bulk) failed: {}", e)))?;

        debug!("✓ Redis MEXPIRE {} keys", entries.len());
        Ok(replies.into_iter().map(|n| n == 1).collect())
    }

    async fn mincr_by(&self, entries: &[(&str, i64)]) -> Result<Vec<i64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, delta) in entries {
            pipe.cmd("INCRBY").arg(*key).arg(*delta);
        }

        let values: Vec<i64> = pipe
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis INCRBY (bulk) failed: {}", e)))?;

        debug!("✓ Redis MINCRBY {} keys", entries.len());
        Ok(values)
    }

    async fn health_check(&self) -> Result<bool> {
        let mut conn = self.connection().await?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis PING failed: {}", e)))?;

        Ok(pong == "PONG" || pong.contains("PONG"))
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis FLUSHDB failed: {}", e)))?;

        warn!("⚠ Redis FLUSHDB executed - all entries cleared!");
        Ok(())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let pattern = scan_pattern(namespace);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(|e| Error::BackendError(format!("Redis SCAN failed: {}", e)))?;

            if !keys.is_empty() {
                let n: u64 = conn
                    .del(&keys)
                    .await
                    .map_err(|e| Error::BackendError(format!("Redis DEL (scan) failed: {}", e)))?;
                removed += n;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        warn!(
            "⚠ Redis CLEAR {} executed - {} entries removed",
            pattern, removed
        );
        Ok(removed)
    }

    async fn acquire_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let millis = lease_millis(lease).to_string();
        let reply = self
            .scripts
            .eval(&self.pool, LockScript::Acquire, key, &[token, millis.as_str()])
            .await?;

        debug!("✓ Redis LOCK {} -> {}", key, reply == 1);
        Ok(reply == 1)
    }

    async fn renew_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let millis = lease_millis(lease).to_string();
        let reply = self
            .scripts
            .eval(&self.pool, LockScript::Renew, key, &[token, millis.as_str()])
            .await?;

        debug!("✓ Redis RENEW {} -> {}", key, reply == 1);
        Ok(reply == 1)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let reply = self
            .scripts
            .eval(&self.pool, LockScript::Release, key, &[token])
            .await?;

        debug!("✓ Redis UNLOCK {} -> {}", key, reply == 1);
        Ok(reply == 1)
    }
}
