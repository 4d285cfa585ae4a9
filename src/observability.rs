//! Metrics hooks for cache and lock operations.
//!
//! Implement [`CacheMetrics`] to feed your monitoring system and attach it
//! with `Cache::with_metrics`:
//!
//! ```ignore
//! use lease_cache::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         // counter!("cache_hits").inc();
//!         // histogram!("cache_latency").record(duration);
//!     }
//!     // ... implement other methods
//! }
//!
//! // let cache = Cache::new(backend).with_metrics(Arc::new(PrometheusMetrics));
//! ```
//!
//! Every method has a default body that logs through the `log` crate. The
//! facade uses `NoOpMetrics` unless told otherwise.
//!
//! | hook | fired by |
//! |------|----------|
//! | `record_hit` | `get` / `get_set` found a real value |
//! | `record_negative_hit` | found the nil sentinel |
//! | `record_miss` | key absent |
//! | `record_produce` | `get_set` ran the producer (once per coalesced group) |
//! | `record_set` / `record_delete` | writes and removals |
//! | `record_lock` | `Cache::with_lock` acquisition outcome |
//! | `record_error` | any failed operation |

use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Record a hit on a cached "no data" marker.
    fn record_negative_hit(&self, key: &str, duration: Duration) {
        debug!("Cache NIL HIT: {} took {:?}", key, duration);
    }

    /// Record a cache miss.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Record one producer run.
    fn record_produce(&self, key: &str, duration: Duration) {
        debug!("Cache PRODUCE: {} took {:?}", key, duration);
    }

    /// Record a cache set operation.
    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    /// Record a cache delete operation.
    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    /// Record a lock acquisition attempt.
    fn record_lock(&self, name: &str, acquired: bool, waited: Duration) {
        debug!("Lock {}: acquired={} after {:?}", name, acquired, waited);
    }

    /// Record an error.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_negative_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_produce(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_lock(&self, _name: &str, _acquired: bool, _waited: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Metrics that only log, using the trait's default bodies.
#[derive(Clone, Default)]
pub struct LogMetrics;

impl CacheMetrics for LogMetrics {}
