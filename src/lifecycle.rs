//! Controls the background maintenance task of a cache.
//!
//! Each cache owns exactly one [Maintenance] which keeps the lifecycle token and the handle of the
//! spawned task. Cancelling the token (via [Maintenance::close] or by dropping the cache) makes
//! the task stop right away, as all of its sleeps are raced against the token.
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the lifecycle of a background maintenance task.
pub struct Maintenance {
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Maintenance {
    /// Spawns the task created by **task** and hands it the lifecycle token.
    ///
    /// # Panics
    /// Panics if not called from within a tokio runtime.
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()));

        Maintenance {
            token,
            task: Mutex::new(Some(handle)),
        }
    }

    /// Returns the lifecycle token which is cancelled once the cache is closed.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Determines if the cache has not been closed yet.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stops the maintenance task.
    ///
    /// Returns **true** if this call performed the shutdown and **false** if it already happened.
    pub fn close(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }

        self.token.cancel();
        true
    }

    /// Waits until the maintenance task has terminated.
    ///
    /// Note that this doesn't stop the task. Use [close](Maintenance::close) first.
    pub async fn join(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                if error.is_panic() {
                    log::error!("The maintenance task of a cache panicked: {}", error);
                }
            }
        }
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use crate::lifecycle::Maintenance;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn close_stops_the_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();

        let maintenance = Maintenance::spawn(|token| async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }
            }
            flag.store(true, Ordering::SeqCst);
        });

        assert!(maintenance.is_running());
        assert!(maintenance.close());
        assert!(!maintenance.close());
        assert!(!maintenance.is_running());

        maintenance.join().await;
        assert!(stopped.load(Ordering::SeqCst));

        // Joining twice is fine...
        maintenance.join().await;
    }

    #[tokio::test]
    async fn dropping_cancels_the_token() {
        let maintenance = Maintenance::spawn(|_| async {});
        let token = maintenance.token().clone();
        drop(maintenance);
        assert!(token.is_cancelled());
    }
}
