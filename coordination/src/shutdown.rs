//! Shutdown coordination
//!
//! Cancels every registered task and joins them in a fixed order:
//!
//! ```text
//! alert loop → auto-open → SOS → safety → authority → countdown
//!            → settle / arm timers → retired handles → detection feed
//! ```
//!
//! The detection feed goes last so the latest count stays readable while
//! the escalation tasks wind down. A task that panicked is logged and the
//! remaining joins continue.
//!
//! Shutdown is reentrant: a second request while one is draining waits for
//! the first to finish instead of starting another pass.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tasks::{TaskKind, TaskRegistry, TaskSlot};
use crate::vehicle::SettleKind;

/// Where the coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPhase {
    Running,
    Draining,
    Drained,
}

/// How one task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Finished,
    Panicked,
    Aborted,
}

/// Outcome of a shutdown or session teardown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Joined tasks, in join order.
    pub joined: Vec<(TaskSlot, JoinStatus)>,
    /// True when this call waited on a shutdown already in progress.
    pub reentrant: bool,
}

impl ShutdownReport {
    pub fn panicked(&self) -> usize {
        self.joined
            .iter()
            .filter(|(_, s)| *s == JoinStatus::Panicked)
            .count()
    }

    pub fn joined_slots(&self) -> Vec<TaskSlot> {
        self.joined.iter().map(|(slot, _)| *slot).collect()
    }
}

/// Cloneable handle over the shared registry.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    registry: Arc<TaskRegistry>,
    phase: Arc<watch::Sender<ShutdownPhase>>,
    // Serializes join passes so a session teardown and a shutdown never
    // race over the same handles.
    join_lock: Arc<Mutex<()>>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        let (tx, _rx) = watch::channel(ShutdownPhase::Running);
        Self {
            registry,
            phase: Arc::new(tx),
            join_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Cancel everything and wait until every task has been joined.
    pub async fn request_shutdown(&self) -> ShutdownReport {
        let mut started = false;
        self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                started = true;
                true
            } else {
                false
            }
        });

        if !started {
            debug!("Shutdown already in progress; waiting for drain");
            let mut rx = self.phase.subscribe();
            // The sender lives as long as `self`, so this cannot fail.
            let _ = rx.wait_for(|p| *p == ShutdownPhase::Drained).await;
            return ShutdownReport {
                joined: Vec::new(),
                reentrant: true,
            };
        }

        info!("Shutdown requested; cancelling all tasks");
        self.registry.cancel_all();

        let _guard = self.join_lock.lock().await;
        let mut order: Vec<TaskSlot> = TaskKind::JOIN_ORDER
            .into_iter()
            .map(TaskSlot::Session)
            .collect();
        order.extend([
            TaskSlot::Settle(SettleKind::VehicleStop),
            TaskSlot::Settle(SettleKind::DoorOpen),
            TaskSlot::Settle(SettleKind::DoorClose),
            TaskSlot::ArmDelay,
        ]);

        let mut handles = self.registry.take(&order);
        let mut rest = self.registry.take_all();
        // Whatever is left: retired handles of other slots, then the feed
        rest.sort_by_key(|(slot, _)| *slot == TaskSlot::DetectionFeed);
        handles.append(&mut rest);

        let joined = join_in_order(handles).await;
        drop(_guard);

        info!(joined = joined.len(), "All tasks joined");
        self.phase.send_replace(ShutdownPhase::Drained);
        ShutdownReport {
            joined,
            reentrant: false,
        }
    }

    /// Cancel the current session's tasks and wait for them. Run-scoped
    /// tasks (feed, settle timers) keep going.
    pub async fn end_session(&self) -> ShutdownReport {
        self.registry.cancel_session();
        self.join(&TaskKind::JOIN_ORDER).await
    }

    /// Cancel and join specific session task kinds.
    pub async fn join(&self, kinds: &[TaskKind]) -> ShutdownReport {
        let slots: Vec<TaskSlot> = kinds.iter().copied().map(TaskSlot::Session).collect();
        for slot in &slots {
            self.registry.cancel(*slot);
        }
        let _guard = self.join_lock.lock().await;
        let handles = self.registry.take(&slots);
        ShutdownReport {
            joined: join_in_order(handles).await,
            reentrant: false,
        }
    }

    /// Back to `Running` for a new engine run. Ignored mid-drain.
    pub fn reset(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Drained {
                *phase = ShutdownPhase::Running;
                true
            } else {
                false
            }
        });
        self.registry.begin_run();
    }
}

async fn join_in_order(handles: Vec<(TaskSlot, JoinHandle<()>)>) -> Vec<(TaskSlot, JoinStatus)> {
    let mut joined = Vec::with_capacity(handles.len());
    for (slot, handle) in handles {
        let status = match handle.await {
            Ok(()) => JoinStatus::Finished,
            Err(e) if e.is_panic() => {
                warn!(%slot, "Task panicked before shutdown");
                JoinStatus::Panicked
            }
            Err(_) => JoinStatus::Aborted,
        };
        debug!(%slot, ?status, "Task joined");
        joined.push((slot, status));
    }
    joined
}
