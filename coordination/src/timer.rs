//! Cancellable countdown timer
//!
//! One primitive backs every wait in the escalation sequence: the pre-alert
//! countdown, each automatic-open countdown, the SOS wait and the authority
//! wait. It ticks at a fixed resolution, reports the remaining time before
//! each sleep, and checks its token before sleeping and right after waking.
//! A cancelled timer never calls `on_complete`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a timer run ended. Expiry is not judged here; the caller decides
/// whether it means success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerOutcome {
    Completed,
    Cancelled,
}

/// A countdown with fixed tick resolution.
#[derive(Debug, Clone, Copy)]
pub struct CancellableTimer {
    duration: Duration,
    tick: Duration,
}

impl CancellableTimer {
    /// Timer with one-second ticks.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            tick: Duration::from_secs(1),
        }
    }

    /// Override the tick resolution. A zero tick is clamped to one millisecond.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run the countdown inline. `on_tick` receives the remaining time
    /// before each sleep.
    pub async fn run<F>(&self, token: &CancellationToken, mut on_tick: F) -> TimerOutcome
    where
        F: FnMut(Duration),
    {
        let mut remaining = self.duration;
        loop {
            if token.is_cancelled() {
                return TimerOutcome::Cancelled;
            }
            if remaining.is_zero() {
                return TimerOutcome::Completed;
            }

            on_tick(remaining);
            let step = remaining.min(self.tick);
            tokio::select! {
                biased;
                _ = token.cancelled() => return TimerOutcome::Cancelled,
                _ = tokio::time::sleep(step) => {}
            }

            if token.is_cancelled() {
                return TimerOutcome::Cancelled;
            }
            remaining -= step;
        }
    }

    /// Spawn the countdown as its own task. `on_complete` fires exactly once
    /// on normal expiry and never after cancellation.
    pub fn start<T, C>(
        self,
        token: CancellationToken,
        on_tick: T,
        on_complete: C,
    ) -> JoinHandle<TimerOutcome>
    where
        T: FnMut(Duration) + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.run(&token, on_tick).await;
            if outcome == TimerOutcome::Completed {
                on_complete();
            }
            outcome
        })
    }
}

/// Remaining time rounded up to whole seconds, for display.
pub fn whole_seconds(remaining: Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// `MM:SS` rendering of a remaining duration.
pub fn format_mm_ss(remaining: Duration) -> String {
    let total = whole_seconds(remaining);
    format!("{:02}:{:02}", total / 60, total % 60)
}
