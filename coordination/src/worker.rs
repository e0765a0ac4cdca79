//! Repeating background worker
//!
//! Runs a body over and over until its token is cancelled. Iterations never
//! overlap: each body future is awaited to completion (or to its own early
//! exit on cancellation) before the next one starts. Bodies wait through
//! [`pause`], which returns as soon as the token fires, so cancellation
//! latency is bounded by how long a body runs between pauses.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sleep for `duration` unless cancelled first. Returns `true` if the full
/// duration elapsed, `false` on cancellation.
pub async fn pause(token: &CancellationToken, duration: Duration) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => !token.is_cancelled(),
    }
}

/// A named loop around a body future.
#[derive(Debug, Clone, Copy)]
pub struct RepeatingWorker {
    name: &'static str,
}

impl RepeatingWorker {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Run the body until cancelled; returns the number of iterations that
    /// started.
    pub async fn run<F, Fut>(&self, token: CancellationToken, mut body: F) -> u64
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut iterations = 0u64;
        while !token.is_cancelled() {
            iterations += 1;
            body(token.clone()).await;
            // Yield so a body that never awaits cannot starve the runtime
            tokio::task::yield_now().await;
        }
        debug!(worker = self.name, iterations, "Repeating worker stopped");
        iterations
    }

    /// Spawn the loop as its own task.
    pub fn spawn<F, Fut>(self, token: CancellationToken, body: F) -> JoinHandle<u64>
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move { self.run(token, body).await })
    }
}
