//! Distributed mutual-exclusion lock with a fencing token and lease renewal.
//!
//! A [`Lock`] is a named lease on a backend key. Each acquisition stores a
//! fresh random token under the key; renewal and release only touch the key
//! while it still holds that token, so a holder whose lease expired can never
//! delete or extend a successor's lock.
//!
//! While held, a watcher task renews the lease every `watch_interval`. It
//! stops on release, on drop, when the lock turns out to be lost, or when the
//! [`RenewalPolicy`] says so.

use crate::backend::KeyValueBackend;
use crate::error::{Error, Result};
use crate::task::{spawn_supervised, Supervised};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// How often a contended `acquire` retries.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Renewals allowed under the default policy.
pub const DEFAULT_MAX_RENEWALS: u32 = 5;

/// How long the watcher keeps a held lock alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPolicy {
    /// Stop after this many successful renewals; the lease then lapses.
    Bounded(u32),
    /// Renew for as long as the lock is held.
    Unbounded,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        RenewalPolicy::Bounded(DEFAULT_MAX_RENEWALS)
    }
}

/// Lock tuning.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub poll_interval: Duration,
    /// Renewal period. `None` = a third of the lease.
    pub watch_interval: Option<Duration>,
    pub renewal: RenewalPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            watch_interval: None,
            renewal: RenewalPolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = Some(interval);
        self
    }

    pub fn with_renewal(mut self, policy: RenewalPolicy) -> Self {
        self.renewal = policy;
        self
    }

    /// Effective renewal period for `lease`.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` unless `0 < interval < lease`
    pub fn watch_interval_for(&self, lease: Duration) -> Result<Duration> {
        let interval = self.watch_interval.unwrap_or(lease / 3);
        if interval.is_zero() || interval >= lease {
            return Err(Error::ConfigError(format!(
                "watch interval {:?} must be positive and shorter than the lease {:?}",
                interval, lease
            )));
        }
        Ok(interval)
    }
}

/// Why a watcher stopped.
#[derive(Debug, Clone)]
pub enum WatchOutcome {
    /// The owner stopped it (release or a new acquisition).
    Stopped,
    /// The renewal policy ran out.
    Exhausted,
    /// The key no longer held our token.
    Lost,
    /// Renewal failed with a backend error.
    Failed(Error),
}

struct Watcher {
    stop: oneshot::Sender<()>,
    task: Supervised<WatchOutcome>,
}

/// A named, token-fenced lease on a backend key.
///
/// # Example
///
/// ```no_run
/// # use lease_cache::{Cache, InMemoryBackend};
/// # use std::time::Duration;
/// # async fn example() -> lease_cache::Result<()> {
/// let cache = Cache::new(InMemoryBackend::new());
/// let mut lock = cache.lock("job:1", Duration::from_secs(10));
///
/// if lock.acquire().await? {
///     // critical section
///     lock.release().await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Lock<B: KeyValueBackend> {
    backend: B,
    name: String,
    lease: Duration,
    config: LockConfig,
    token: Option<String>,
    renewals: Arc<AtomicU32>,
    watcher: Option<Watcher>,
}

impl<B: KeyValueBackend> Lock<B> {
    /// Lock on `name` (used verbatim as the backend key) with the default config.
    pub fn new(backend: B, name: impl Into<String>, lease: Duration) -> Self {
        Self::with_config(backend, name, lease, LockConfig::default())
    }

    pub fn with_config(
        backend: B,
        name: impl Into<String>,
        lease: Duration,
        config: LockConfig,
    ) -> Self {
        Lock {
            backend,
            name: name.into(),
            lease,
            config,
            token: None,
            renewals: Arc::new(AtomicU32::new(0)),
            watcher: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Fencing token of the current hold.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Whether this handle believes it holds the lock. The lease may still
    /// have lapsed on the backend; `release` tells for sure.
    pub fn is_held(&self) -> bool {
        self.token.is_some()
    }

    /// Successful renewals since the last acquisition.
    pub fn renewals(&self) -> u32 {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Try to take the lock, waiting up to `lease + poll_interval`.
    ///
    /// Calling it while already held refreshes the lease under the same token.
    ///
    /// # Returns
    /// - `Ok(true)` - Lock held, watcher running
    /// - `Ok(false)` - Still contended when the wait ran out. A handle that
    ///   was holding has lost its lease and no longer holds.
    ///
    /// # Errors
    /// Returns `Err` on invalid timing config or backend error (no retry)
    pub async fn acquire(&mut self) -> Result<bool> {
        if self.lease.is_zero() {
            return Err(Error::ConfigError(format!(
                "lock {} needs a non-zero lease",
                self.name
            )));
        }
        let interval = self.config.watch_interval_for(self.lease)?;
        let poll = self.config.poll_interval;

        let token = self
            .token
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let deadline = Instant::now() + self.lease + poll;

        loop {
            if self
                .backend
                .acquire_lock(&self.name, &token, self.lease)
                .await?
            {
                self.stop_watcher().await;
                self.token = Some(token);
                self.renewals.store(0, Ordering::SeqCst);
                self.start_watcher(interval);
                debug!("✓ lock {} acquired (lease: {:?})", self.name, self.lease);
                return Ok(true);
            }

            if Instant::now() >= deadline {
                if self.token.take().is_some() {
                    warn!("⚠ lock {} was lost to another holder", self.name);
                    self.stop_watcher().await;
                } else {
                    debug!("✓ lock {} still contended, giving up", self.name);
                }
                return Ok(false);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Release the lock if this handle still owns it.
    ///
    /// # Returns
    /// `Ok(false)` when the lock was not held, or was lost to expiry and
    /// possibly taken by someone else.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs. The handle then still holds the
    /// token and keeps renewing, so `release` can be retried.
    pub async fn release(&mut self) -> Result<bool> {
        let Some(token) = self.token.clone() else {
            return Ok(false);
        };

        let released = self.backend.release_lock(&self.name, &token).await?;
        self.token = None;
        self.stop_watcher().await;

        if released {
            debug!("✓ lock {} released", self.name);
        } else {
            warn!(
                "⚠ lock {} was no longer owned at release (lease expired?)",
                self.name
            );
        }
        Ok(released)
    }

    fn start_watcher(&mut self, interval: Duration) {
        let (stop, stopped) = oneshot::channel();
        let task = spawn_supervised(
            format!("lock-watcher:{}", self.name),
            watch(
                self.backend.clone(),
                self.name.clone(),
                self.token.clone().unwrap_or_default(),
                self.lease,
                interval,
                self.config.renewal,
                Arc::clone(&self.renewals),
                stopped,
            ),
        );
        self.watcher = Some(Watcher { stop, task });
    }

    async fn stop_watcher(&mut self) {
        let Some(watcher) = self.watcher.take() else {
            return;
        };
        // Err means the watcher already returned on its own.
        let _ = watcher.stop.send(());
        match watcher.task.join().await {
            Ok(outcome) => debug!("» lock {} watcher ended: {:?}", self.name, outcome),
            Err(e) => warn!("⚠ lock {} watcher failed: {}", self.name, e),
        }
    }
}

impl<B: KeyValueBackend> Drop for Lock<B> {
    fn drop(&mut self) {
        if self.watcher.is_some() {
            debug!(
                "» lock {} dropped while held; lease will expire on its own",
                self.name
            );
        }
        // Supervised aborts the watcher when dropped.
        self.watcher.take();
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch<B: KeyValueBackend>(
    backend: B,
    name: String,
    token: String,
    lease: Duration,
    interval: Duration,
    policy: RenewalPolicy,
    renewals: Arc<AtomicU32>,
    mut stop: oneshot::Receiver<()>,
) -> WatchOutcome {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop => return WatchOutcome::Stopped,
            _ = ticker.tick() => {}
        }

        if let RenewalPolicy::Bounded(max) = policy {
            if renewals.load(Ordering::SeqCst) >= max {
                debug!("» lock {} reached {} renewals, letting lease lapse", name, max);
                return WatchOutcome::Exhausted;
            }
        }

        match backend.renew_lock(&name, &token, lease).await {
            Ok(true) => {
                let n = renewals.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("✓ lock {} renewed ({})", name, n);
            }
            Ok(false) => {
                warn!("⚠ lock {} lost: key no longer holds our token", name);
                return WatchOutcome::Lost;
            }
            Err(e) => {
                warn!("⚠ lock {} renewal failed: {}", name, e);
                return WatchOutcome::Failed(e);
            }
        }
    }
}
