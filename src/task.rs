//! Owned background tasks.
//!
//! Every background task the crate starts (lock watchers, Redis script
//! re-registration) goes through [`spawn_supervised`]. The returned
//! [`Supervised`] handle owns the task: the owner either joins it, getting a
//! panic back as [`Error::TaskFailed`] instead of losing it, or abandons it,
//! which aborts the task. Dropping the handle abandons.

use crate::error::{Error, Result};
use futures::FutureExt;
use std::future::Future;
use tokio::task::{JoinError, JoinHandle};

/// Handle to a task started with [`spawn_supervised`].
#[derive(Debug)]
pub struct Supervised<T> {
    name: String,
    handle: Option<JoinHandle<T>>,
}

/// Spawn `future` on the current tokio runtime under an owning handle.
pub fn spawn_supervised<F>(name: impl Into<String>, future: F) -> Supervised<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name.into();
    debug!("» spawning background task {}", name);
    Supervised {
        name,
        handle: Some(tokio::spawn(future)),
    }
}

impl<T> Supervised<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the task and report how it ended.
    ///
    /// # Errors
    /// Returns `Error::TaskFailed` if the task panicked or was aborted.
    pub async fn join(mut self) -> Result<T> {
        match self.handle.take() {
            Some(handle) => {
                let outcome = handle.await;
                outcome.map_err(|e| report(&self.name, e))
            }
            None => Err(Error::TaskFailed(format!("{} already joined", self.name))),
        }
    }

    /// Collect the outcome if the task already finished, without waiting.
    pub fn try_join(&mut self) -> Option<Result<T>> {
        if !self.is_finished() {
            return None;
        }
        let mut handle = self.handle.take()?;
        match (&mut handle).now_or_never() {
            Some(outcome) => Some(outcome.map_err(|e| report(&self.name, e))),
            None => {
                self.handle = Some(handle);
                None
            }
        }
    }

    /// Stop the task without waiting for it.
    pub fn abandon(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                debug!("» abandoning background task {}", self.name);
            }
            handle.abort();
        }
    }
}

impl<T> Drop for Supervised<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

fn report(name: &str, e: JoinError) -> Error {
    if e.is_panic() {
        let payload = e.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        error!("✗ background task {} panicked: {}", name, msg);
        Error::TaskFailed(format!("{} panicked: {}", name, msg))
    } else {
        Error::TaskFailed(format!("{} was cancelled", name))
    }
}
