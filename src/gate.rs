//! Provides a one-shot readiness signal which any number of tasks can wait for.
//!
//! A [Gate] starts closed and is resolved exactly once. Resolving it again is a no-op, so several
//! code paths (a successful computation, a shutdown, a panic unwinding through a [GateGuard]) can
//! all try to resolve it without coordinating with each other.
//!
//! # Example
//!
//! ```
//! # use evergreen::gate::Gate;
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() {
//! let gate = Arc::new(Gate::new());
//!
//! let waiter = {
//!     let gate = gate.clone();
//!     tokio::spawn(async move { gate.wait().await })
//! };
//!
//! assert_eq!(gate.resolve(), true);
//! // Only the first call actually resolves the gate...
//! assert_eq!(gate.resolve(), false);
//!
//! waiter.await.unwrap();
//! assert_eq!(gate.is_resolved(), true);
//! # }
//! ```
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A single-resolution broadcast signal.
pub struct Gate {
    state: watch::Sender<bool>,
}

impl Default for Gate {
    fn default() -> Self {
        Gate::new()
    }
}

impl Gate {
    /// Creates a new, unresolved gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Gate { state }
    }

    /// Resolves the gate and wakes up all waiters.
    ///
    /// Returns **true** if this call resolved the gate and **false** if it already was resolved.
    pub fn resolve(&self) -> bool {
        self.state.send_if_modified(|resolved| !std::mem::replace(resolved, true))
    }

    /// Determines if the gate has already been resolved.
    pub fn is_resolved(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the gate is resolved.
    pub async fn wait(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as self, therefore this cannot fail.
        let _ = receiver.wait_for(|resolved| *resolved).await;
    }

    /// Waits until either the gate is resolved or the given token is cancelled.
    ///
    /// Returns **true** if the gate was resolved. If both happened, the gate wins.
    pub async fn wait_or_cancel(&self, ctx: &CancellationToken) -> bool {
        if self.is_resolved() {
            return true;
        }

        tokio::select! {
            biased;
            _ = self.wait() => true,
            _ = ctx.cancelled() => false,
        }
    }

    /// Returns a guard which resolves this gate once it is dropped.
    ///
    /// This makes sure that waiters are released on every exit path, including early returns
    /// and panics.
    pub fn guard(&self) -> GateGuard<'_> {
        GateGuard { gate: self }
    }
}

/// Resolves the underlying [Gate] when dropped.
pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let _ = self.gate.resolve();
    }
}

#[cfg(test)]
mod tests {
    use crate::gate::Gate;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn all_waiters_are_released() {
        let gate = Arc::new(Gate::new());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        assert!(gate.resolve());

        for waiter in waiters {
            waiter.await.unwrap();
        }
    }

    #[tokio::test]
    async fn waiting_on_a_resolved_gate_returns_immediately() {
        let gate = Gate::new();
        assert!(gate.resolve());
        assert!(!gate.resolve());

        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(gate.wait_or_cancel(&ctx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let gate = Gate::new();
        let ctx = CancellationToken::new();

        let canceller = ctx.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        assert!(!gate.wait_or_cancel(&ctx).await);
        assert!(!gate.is_resolved());
    }

    #[test]
    fn guards_resolve_on_panic() {
        let gate = Gate::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = gate.guard();
            panic!("producer failed");
        }));

        assert!(result.is_err());
        assert!(gate.is_resolved());
    }
}
