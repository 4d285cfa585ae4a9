//! Memcached Backend Integration Tests
//!
//! These tests require a running Memcached instance.
//!
//! ```bash
//! docker run --rm -p 11211:11211 memcached:1.6
//! cargo test --features memcached --test memcached_integration_test
//! ```
//!
//! **Note:** Tests use unique key prefixes per test to avoid conflicts when run
//! in parallel, and never flush (Memcached can only flush the whole server).
//!
//! ## Environment Variables
//!
//! - `TEST_MEMCACHED_URL`: Memcached server address (default: "localhost:11211")

#![cfg(feature = "memcached")]

use lease_cache::backend::{KeyValueBackend, MemcachedBackend, MemcachedConfig};
use lease_cache::{Cache, Error, Produced};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Helper: Get Memcached server address from environment or use default
fn get_memcached_url() -> String {
    env::var("TEST_MEMCACHED_URL").unwrap_or_else(|_| "localhost:11211".to_string())
}

/// Helper: Create a test Memcached backend
async fn create_test_backend() -> Result<MemcachedBackend, Box<dyn std::error::Error>> {
    let memcached_url = get_memcached_url();
    println!("Connecting to Memcached: {}", memcached_url);

    let config = MemcachedConfig {
        servers: vec![memcached_url],
        connection_timeout: Duration::from_secs(5),
        pool_size: 32, // Increased for parallel test execution
    };
    let backend = MemcachedBackend::new(config).await?;
    Ok(backend)
}

/// Helper: Check if Memcached is available
async fn is_memcached_available() -> bool {
    match create_test_backend().await {
        Ok(backend) => backend.health_check().await.unwrap_or(false),
        Err(_) => false,
    }
}

/// Helper: facade under a prefix unique to this test
async fn create_test_cache() -> Cache<MemcachedBackend> {
    let backend = create_test_backend()
        .await
        .expect("Failed to create Memcached backend");
    // memcached keys: no spaces or control characters
    Cache::new(backend).with_prefix(format!("test_{}", Uuid::new_v4().simple()))
}

macro_rules! require_memcached {
    () => {
        if !is_memcached_available().await {
            println!("⚠️  Memcached not available, skipping test");
            return;
        }
    };
}

#[tokio::test]
async fn test_memcached_set_get_forget() {
    require_memcached!();
    let cache = create_test_cache().await;

    cache
        .set("name", "alice", Duration::from_secs(60))
        .await
        .expect("SET should succeed");
    assert_eq!(cache.get("name").await.val().unwrap(), "alice");

    assert!(cache.forget("name").await.unwrap());
    assert!(!cache.forget("name").await.unwrap());
    assert!(cache.get("name").await.is_absent());
    println!("✓ set/get/forget round trip");
}

#[tokio::test]
async fn test_memcached_ttl_expiration() {
    require_memcached!();
    let cache = create_test_cache().await;

    cache.set("short", "v", Duration::from_secs(1)).await.unwrap();
    assert!(cache.get("short").await.is_present());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(cache.get("short").await.is_absent());
}

#[tokio::test]
async fn test_memcached_add_and_counters() {
    require_memcached!();
    let cache = create_test_cache().await;

    assert!(cache.add("once", "a", None).await.unwrap());
    assert!(!cache.add("once", "b", None).await.unwrap());
    assert_eq!(cache.get("once").await.val().unwrap(), "a");

    assert_eq!(cache.increment("hits", 3).await.unwrap(), 3);
    assert_eq!(cache.increment("hits", 2).await.unwrap(), 5);
    assert_eq!(cache.decrement("hits", 1).await.unwrap(), 4);

    cache.forget_many(&["once", "hits"]).await.unwrap();
}

#[tokio::test]
async fn test_memcached_get_many_with_missing_keys() {
    require_memcached!();
    let cache = create_test_cache().await;

    cache.forever("a", "1").await.unwrap();
    cache.forever("c", "3").await.unwrap();

    let found = cache.get_many(&["a", "b", "c"]).await;
    assert_eq!(found["a"].val().unwrap(), "1");
    assert!(found["b"].is_absent());
    assert_eq!(found["c"].val().unwrap(), "3");

    assert_eq!(cache.forget_many(&["a", "b", "c"]).await.unwrap(), 2);
}

#[tokio::test]
async fn test_memcached_expire_rewrites_ttl() {
    require_memcached!();
    let cache = create_test_cache().await;

    cache.forever("k", "v").await.unwrap();
    assert!(cache.expire("k", Duration::from_secs(1)).await.unwrap());
    assert!(!cache.expire("missing", Duration::from_secs(1)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(cache.get("k").await.is_absent());
}

#[tokio::test]
async fn test_memcached_read_through_and_negative_cache() {
    require_memcached!();
    let cache = create_test_cache().await;
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let result = cache
            .get_set("ghost", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Produced::no_data())
            })
            .await;
        assert!(result.is_absent());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.forget("ghost").await.unwrap();
}

#[tokio::test]
async fn test_memcached_locks_unsupported() {
    require_memcached!();
    let cache = create_test_cache().await;

    let mut lock = cache.lock("job:1", Duration::from_secs(1));
    assert!(matches!(lock.acquire().await, Err(Error::NotImplemented(_))));

    let out = cache
        .with_lock("job:1", Duration::from_secs(1), || async { Ok(()) })
        .await;
    assert!(matches!(out, Err(Error::NotImplemented(_))));
}
