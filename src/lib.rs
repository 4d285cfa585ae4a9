//! # lease-cache
//!
//! A cache client facade over interchangeable key-value stores (in-memory,
//! Redis, Memcached) with two concurrency primitives on top:
//!
//! - **Request coalescing:** concurrent misses on the same key run the
//!   producer once and share its outcome, error included.
//! - **Distributed locks:** token-fenced leases with a background watcher
//!   that renews them while held.
//!
//! Read-through fills also do **negative caching**: a producer that reports
//! "no data" gets a short-lived marker stored, so repeated lookups for
//! something that does not exist stop hitting the source.
//!
//! ## Quick Start
//!
//! ```
//! use lease_cache::{Cache, InMemoryBackend, Produced};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> lease_cache::Result<()> {
//! let cache = Cache::new(InMemoryBackend::new()).with_prefix("app");
//!
//! cache.set("name", "alice", Duration::from_secs(60)).await?;
//! assert_eq!(cache.get("name").await.string()?, Some("alice".to_string()));
//!
//! // Read-through: the closure runs only on a miss
//! let user = cache
//!     .get_set("user:42", || async { Ok(Produced::no_data()) })
//!     .await;
//! assert!(user.is_absent());
//!
//! // Critical section under a distributed lock
//! let done = cache
//!     .with_lock("job:1", Duration::from_secs(10), || async { Ok(()) })
//!     .await?;
//! assert!(done.is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Choosing a backend at runtime
//!
//! ```no_run
//! use lease_cache::{Cache, CacheConfig};
//!
//! # async fn example() -> lease_cache::Result<()> {
//! // CACHE_DRIVER=redis REDIS_URL=redis://localhost:6379/0 CACHE_PREFIX=app
//! let cache = Cache::connect(CacheConfig::from_env()?).await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod key;
pub mod lock;
pub mod observability;
pub mod payload;
pub mod result;
pub mod task;

// Re-exports for convenience
pub use backend::{AnyBackend, InMemoryBackend, KeyValueBackend};
pub use cache::{Cache, Produced};
pub use coalesce::CallGroup;
pub use config::{CacheConfig, Driver};
pub use error::{Error, Result};
pub use key::KeyPrefix;
pub use lock::{Lock, LockConfig, RenewalPolicy};
pub use payload::{IntoPayload, Json, Postcard};
pub use result::CacheResult;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
