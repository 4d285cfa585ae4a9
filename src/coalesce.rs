//! In-process request coalescing.
//!
//! [`CallGroup::call`] runs at most one producer per key at a time. The first
//! caller for a key runs the producer itself; every caller that arrives while
//! it runs waits and receives a clone of the same outcome,
//! error included. The registry entry is removed before waiters are released,
//! so a caller arriving afterwards starts a new generation.
//!
//! Waiters can stop waiting by dropping their future (for example through
//! `tokio::time::timeout`); that detaches only them. If the owning caller's
//! future is dropped mid-flight, the entry is still removed and the waiters
//! get [`Error::CallAbandoned`] instead of hanging.

use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use tokio::sync::watch;

type Slot<T> = watch::Receiver<Option<Result<T>>>;

/// Registry of in-flight computations, keyed by an opaque string.
pub struct CallGroup<T> {
    calls: DashMap<String, Slot<T>>,
}

impl<T> CallGroup<T>
where
    T: Clone + Send + Sync,
{
    pub fn new() -> Self {
        CallGroup {
            calls: DashMap::new(),
        }
    }

    /// Run `producer` for `key`, or join the run already in flight.
    ///
    /// # Errors
    /// Returns whatever the producer returned, or `Error::CallAbandoned` when
    /// joining a run whose owner was cancelled.
    pub async fn call<F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let publisher = match self.register(key) {
            Ok(publisher) => publisher,
            Err(slot) => {
                debug!("» joining in-flight call for {}", key);
                return Self::wait(key, slot).await;
            }
        };

        let guard = Registration {
            calls: &self.calls,
            key,
        };
        let result = producer().await;

        // Unregister first: anyone arriving from here on runs a fresh call.
        drop(guard);
        publisher.send_replace(Some(result.clone()));
        result
    }

    /// Claim `key`, or hand back the slot of the call already running.
    ///
    /// Kept synchronous so no map guard can live across an await.
    fn register(&self, key: &str) -> std::result::Result<watch::Sender<Option<Result<T>>>, Slot<T>> {
        match self.calls.entry(key.to_string()) {
            Entry::Occupied(entry) => Err(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                Ok(tx)
            }
        }
    }

    /// Number of keys with a producer currently running.
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.calls.contains_key(key)
    }

    async fn wait(key: &str, mut slot: Slot<T>) -> Result<T> {
        match slot.wait_for(Option::is_some).await {
            Ok(published) => match &*published {
                Some(result) => result.clone(),
                None => Err(Error::CallAbandoned(key.to_string())),
            },
            Err(_) => Err(Error::CallAbandoned(key.to_string())),
        }
    }
}

impl<T> Default for CallGroup<T>
where
    T: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the registry entry when the owning call ends, however it ends.
struct Registration<'a, T> {
    calls: &'a DashMap<String, Slot<T>>,
    key: &'a str,
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.calls.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let group = Arc::new(CallGroup::<String>::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                group
                    .call("user:1", || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok("alice".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "alice");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reaches_every_waiter() {
        let group = Arc::new(CallGroup::<u32>::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let group = Arc::clone(&group);
            handles.push(tokio::spawn(async move {
                group
                    .call("k", || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(Error::producer("db down"))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(Error::Producer(_))));
        }
    }

    #[tokio::test]
    async fn test_sequential_calls_run_fresh() {
        let group = CallGroup::<usize>::new();
        let runs = AtomicUsize::new(0);

        for expected in 1..=3 {
            let got = group
                .call("k", || async { Ok(runs.fetch_add(1, Ordering::SeqCst) + 1) })
                .await
                .unwrap();
            assert_eq!(got, expected);
        }
        assert!(!group.is_in_flight("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_do_not_serialize() {
        let group = Arc::new(CallGroup::<&'static str>::new());
        let slow = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .call("slow", || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok("slow")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        let fast = group.call("fast", || async { Ok("fast") }).await.unwrap();
        assert_eq!(fast, "fast");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(slow.await.unwrap().unwrap(), "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_owner_releases_waiters() {
        let group = Arc::new(CallGroup::<u32>::new());
        let owner = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .call("k", || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(group.is_in_flight("k"));

        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.call("k", || async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        owner.abort();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::CallAbandoned(_))
        ));
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_can_detach_without_stopping_owner() {
        let group = Arc::new(CallGroup::<u32>::new());
        let owner = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .call("k", || async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(7)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let detached = tokio::time::timeout(
            Duration::from_secs(1),
            group.call("k", || async { Ok(0) }),
        )
        .await;
        assert!(detached.is_err());
        assert_eq!(owner.await.unwrap().unwrap(), 7);
    }
}
