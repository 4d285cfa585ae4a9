//! Basic usage example of lease-cache.
//!
//! Run with: cargo run --example basic_usage
//!
//! Set `CACHE_DRIVER=redis` (and `REDIS_URL`) to run the same flow against Redis.

use lease_cache::{Cache, CacheConfig, Error, Json, Produced, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Example entity: Employment
#[derive(Clone, Serialize, Deserialize, Debug)]
struct Employment {
    id: String,
    employer_name: String,
    salary: f64,
}

/// Simulates a slow database lookup
async fn fetch_employment(id: &str, queries: &AtomicUsize) -> Result<Produced> {
    queries.fetch_add(1, Ordering::SeqCst);
    println!("  [DB] Fetching employment: {}", id);
    tokio::time::sleep(Duration::from_millis(100)).await;

    match id {
        "emp_001" => Produced::value(
            Json(Employment {
                id: id.to_string(),
                employer_name: "Acme Corp".to_string(),
                salary: 75000.0,
            }),
            Duration::from_secs(300),
        ),
        "emp_500" => Err(Error::producer("database unavailable")),
        _ => Ok(Produced::no_data()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== lease-cache - Basic Example ===\n");

    // 1. Build the cache from the environment (defaults to in-memory)
    println!("1. Connecting cache backend...");
    let config = CacheConfig::from_env()?.with_prefix("demo");
    let cache = Cache::connect(config).await?;
    println!("   ✓ {} backend ready\n", cache.backend().driver_name());

    // 2. Plain set/get
    println!("2. Set and get:");
    cache.set("greeting", "hello", Duration::from_secs(60)).await?;
    println!("   ✓ greeting = {}\n", cache.get("greeting").await.val()?);

    // 3. Read-through with coalescing: 10 concurrent callers, one query
    println!("3. Ten concurrent requests for emp_001:");
    let queries = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let queries = Arc::clone(&queries);
        handles.push(tokio::spawn(async move {
            cache
                .get_set("employment:emp_001", || async move {
                    fetch_employment("emp_001", &queries).await
                })
                .await
        }));
    }
    for handle in handles {
        let result = handle
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?;
        if let Some(emp) = result.json::<Employment>()? {
            println!("   ✓ {} at {} (${:.2})", emp.id, emp.employer_name, emp.salary);
        }
    }
    println!("   ✓ database queried {} time(s)\n", queries.load(Ordering::SeqCst));

    // 4. Negative caching: a missing row is remembered briefly
    println!("4. Missing employment (emp_404), asked twice:");
    for _ in 0..2 {
        let result = cache
            .get_set("employment:emp_404", || {
                fetch_employment("emp_404", &queries)
            })
            .await;
        println!("   ✓ present: {}", result.is_present());
    }
    println!();

    // 5. Producer errors are returned, not cached
    println!("5. Failing lookup (emp_500):");
    let result = cache
        .get_set("employment:emp_500", || fetch_employment("emp_500", &queries))
        .await;
    if let Some(e) = result.err() {
        println!("   ⚠ {}\n", e);
    }

    // 6. Critical section under a distributed lock
    println!("6. Payroll run under a lock:");
    match cache
        .with_lock("payroll", Duration::from_secs(10), || async {
            println!("   ✓ running payroll");
            Ok(())
        })
        .await?
    {
        Some(()) => println!("   ✓ lock released\n"),
        None => println!("   ⚠ another worker holds the lock\n"),
    }

    // 7. Clean up everything under our prefix
    cache.flush().await?;
    println!("7. ✓ Flushed demo keys\n");

    Ok(())
}
