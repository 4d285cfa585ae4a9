//! Backend chosen at runtime from configuration.

use super::{InMemoryBackend, KeyValueBackend};
#[cfg(feature = "memcached")]
use super::MemcachedBackend;
#[cfg(feature = "redis")]
use super::RedisBackend;
use crate::error::Result;
use std::time::Duration;

/// One of the compiled-in backends, picked by `CacheConfig::driver`.
#[derive(Clone)]
pub enum AnyBackend {
    InMemory(InMemoryBackend),
    #[cfg(feature = "redis")]
    Redis(RedisBackend),
    #[cfg(feature = "memcached")]
    Memcached(MemcachedBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $call:expr) => {
        match $self {
            AnyBackend::InMemory($b) => $call,
            #[cfg(feature = "redis")]
            AnyBackend::Redis($b) => $call,
            #[cfg(feature = "memcached")]
            AnyBackend::Memcached($b) => $call,
        }
    };
}

impl AnyBackend {
    pub fn driver_name(&self) -> &'static str {
        match self {
            AnyBackend::InMemory(_) => "inmemory",
            #[cfg(feature = "redis")]
            AnyBackend::Redis(_) => "redis",
            #[cfg(feature = "memcached")]
            AnyBackend::Memcached(_) => "memcached",
        }
    }
}

impl From<InMemoryBackend> for AnyBackend {
    fn from(backend: InMemoryBackend) -> Self {
        AnyBackend::InMemory(backend)
    }
}

#[cfg(feature = "redis")]
impl From<RedisBackend> for AnyBackend {
    fn from(backend: RedisBackend) -> Self {
        AnyBackend::Redis(backend)
    }
}

#[cfg(feature = "memcached")]
impl From<MemcachedBackend> for AnyBackend {
    fn from(backend: MemcachedBackend) -> Self {
        AnyBackend::Memcached(backend)
    }
}

impl KeyValueBackend for AnyBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        dispatch!(self, b => b.get(key).await)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        dispatch!(self, b => b.set(key, value, ttl).await)
    }

    async fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<bool> {
        dispatch!(self, b => b.add(key, value, ttl).await)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        dispatch!(self, b => b.delete(key).await)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        dispatch!(self, b => b.expire(key, ttl).await)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        dispatch!(self, b => b.incr_by(key, delta).await)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        dispatch!(self, b => b.exists(key).await)
    }

    async fn mget(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        dispatch!(self, b => b.mget(keys).await)
    }

    async fn mexists(&self, keys: &[&str]) -> Result<Vec<bool>> {
        dispatch!(self, b => b.mexists(keys).await)
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        dispatch!(self, b => b.mset(entries, ttl).await)
    }

    async fn mdelete(&self, keys: &[&str]) -> Result<u64> {
        dispatch!(self, b => b.mdelete(keys).await)
    }

    async fn mexpire(&self, entries: &[(&str, Duration)]) -> Result<Vec<bool>> {
        dispatch!(self, b => b.mexpire(entries).await)
    }

    async fn mincr_by(&self, entries: &[(&str, i64)]) -> Result<Vec<i64>> {
        dispatch!(self, b => b.mincr_by(entries).await)
    }

    async fn health_check(&self) -> Result<bool> {
        dispatch!(self, b => b.health_check().await)
    }

    async fn clear_all(&self) -> Result<()> {
        dispatch!(self, b => b.clear_all().await)
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<u64> {
        dispatch!(self, b => b.clear_namespace(namespace).await)
    }

    async fn acquire_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        dispatch!(self, b => b.acquire_lock(key, token, lease).await)
    }

    async fn renew_lock(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        dispatch!(self, b => b.renew_lock(key, token, lease).await)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        dispatch!(self, b => b.release_lock(key, token).await)
    }
}
