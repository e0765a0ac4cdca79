//! Task registry: at most one live task per kind
//!
//! Every background activity the orchestrator starts is registered here
//! under a [`TaskSlot`]. Cancellation tokens form a tree:
//!
//! ```text
//! run token (one per engine run)
//!   ├── session token (one per escalation session)
//!   │     └── one child per session task kind
//!   ├── settle / arm-delay timers
//!   └── detection feed
//! ```
//!
//! Spawning into a slot whose task is still running is a no-op. A handle
//! replaced while its task is still running is kept aside and joined at
//! shutdown; finished handles are dropped on the spot.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::vehicle::SettleKind;

/// Background activities scoped to one escalation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CountdownToAlert,
    AlertLoop,
    AutoOpenRetry,
    SosWait,
    AuthorityWait,
    SafetyInstructionLoop,
}

impl TaskKind {
    /// Join order on shutdown. The countdown goes last among session tasks;
    /// it has no side effects beyond its tick messages.
    pub const JOIN_ORDER: [TaskKind; 6] = [
        Self::AlertLoop,
        Self::AutoOpenRetry,
        Self::SosWait,
        Self::SafetyInstructionLoop,
        Self::AuthorityWait,
        Self::CountdownToAlert,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountdownToAlert => write!(f, "countdown_to_alert"),
            Self::AlertLoop => write!(f, "alert_loop"),
            Self::AutoOpenRetry => write!(f, "auto_open_retry"),
            Self::SosWait => write!(f, "sos_wait"),
            Self::AuthorityWait => write!(f, "authority_wait"),
            Self::SafetyInstructionLoop => write!(f, "safety_instruction_loop"),
        }
    }
}

/// Registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "slot", content = "kind")]
pub enum TaskSlot {
    Session(TaskKind),
    Settle(SettleKind),
    ArmDelay,
    DetectionFeed,
}

impl fmt::Display for TaskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(kind) => write!(f, "{kind}"),
            Self::Settle(kind) => write!(f, "settle_{kind}"),
            Self::ArmDelay => write!(f, "arm_delay"),
            Self::DetectionFeed => write!(f, "detection_feed"),
        }
    }
}

/// Result of a spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned,
    /// A task of this slot is still running; nothing was started.
    AlreadyActive,
    /// Session task requested with no session open.
    NoSession,
    /// The run token is cancelled; shutdown is in progress.
    ShuttingDown,
}

struct Entry {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    run_token: CancellationToken,
    session_token: Option<CancellationToken>,
    slots: HashMap<TaskSlot, Entry>,
    retired: Vec<(TaskSlot, JoinHandle<()>)>,
    spawn_counts: HashMap<TaskSlot, u32>,
}

/// Shared registry of live background tasks.
pub struct TaskRegistry {
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                run_token: CancellationToken::new(),
                session_token: None,
                slots: HashMap::new(),
                retired: Vec::new(),
                spawn_counts: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding this lock cannot leave the maps half-updated
        // in a way that matters; keep going with the inner value.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fresh run token for a new engine run. No-op while the current one is
    /// still live.
    pub fn begin_run(&self) -> CancellationToken {
        let mut inner = self.lock();
        if inner.run_token.is_cancelled() {
            inner.run_token = CancellationToken::new();
            inner.session_token = None;
        }
        inner.run_token.clone()
    }

    pub fn run_token(&self) -> CancellationToken {
        self.lock().run_token.clone()
    }

    /// Cancel the run token and with it every registered task.
    pub fn cancel_all(&self) {
        self.lock().run_token.cancel();
    }

    /// Open a session scope. Any previous session token is cancelled.
    pub fn begin_session(&self) -> CancellationToken {
        let mut inner = self.lock();
        if let Some(previous) = inner.session_token.take() {
            previous.cancel();
        }
        let token = inner.run_token.child_token();
        inner.session_token = Some(token.clone());
        token
    }

    /// Cancel the session token. Handles stay registered until joined.
    pub fn cancel_session(&self) {
        if let Some(token) = self.lock().session_token.take() {
            token.cancel();
        }
    }

    pub fn has_session(&self) -> bool {
        self.lock()
            .session_token
            .as_ref()
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Spawn a session-scoped task unless one of the same kind is running.
    pub fn spawn_session<F, Fut>(&self, kind: TaskKind, make: F) -> SpawnOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        let Some(parent) = inner.session_token.clone() else {
            return SpawnOutcome::NoSession;
        };
        if parent.is_cancelled() {
            return SpawnOutcome::NoSession;
        }
        Self::spawn_locked(&mut inner, TaskSlot::Session(kind), &parent, make)
    }

    /// Spawn a run-scoped task (settle timer, arm delay, detection feed).
    /// Unlike session tasks, a newer request supersedes a running one: the
    /// old task is cancelled and its handle retired.
    pub fn spawn_replacing<F, Fut>(&self, slot: TaskSlot, make: F) -> SpawnOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if let Some(old) = inner.slots.remove(&slot) {
            old.token.cancel();
            Self::retire(&mut inner, slot, old.handle);
        }
        let parent = inner.run_token.clone();
        Self::spawn_locked(&mut inner, slot, &parent, make)
    }

    fn spawn_locked<F, Fut>(
        inner: &mut Inner,
        slot: TaskSlot,
        parent: &CancellationToken,
        make: F,
    ) -> SpawnOutcome
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if inner.run_token.is_cancelled() {
            return SpawnOutcome::ShuttingDown;
        }
        if let Some(existing) = inner.slots.get(&slot) {
            if !existing.handle.is_finished() {
                debug!(%slot, "Spawn ignored; task already active");
                return SpawnOutcome::AlreadyActive;
            }
        }
        if let Some(finished) = inner.slots.remove(&slot) {
            Self::retire(inner, slot, finished.handle);
        }
        inner.retired.retain(|(_, handle)| !handle.is_finished());

        let token = parent.child_token();
        let handle = tokio::spawn(make(token.clone()));
        inner.slots.insert(slot, Entry { token, handle });
        *inner.spawn_counts.entry(slot).or_insert(0) += 1;
        debug!(%slot, "Task spawned");
        SpawnOutcome::Spawned
    }

    fn retire(inner: &mut Inner, slot: TaskSlot, handle: JoinHandle<()>) {
        if handle.is_finished() {
            return;
        }
        inner.retired.push((slot, handle));
    }

    /// Cancel one slot's task without waiting for it.
    pub fn cancel(&self, slot: TaskSlot) {
        if let Some(entry) = self.lock().slots.get(&slot) {
            entry.token.cancel();
        }
    }

    /// Whether a task of this slot is registered and still running.
    pub fn is_active(&self, slot: TaskSlot) -> bool {
        self.lock().slots.get(&slot).is_some_and(|e| {
            !e.handle.is_finished() && !e.token.is_cancelled()
        })
    }

    /// Session kinds whose tasks are still running.
    pub fn active_kinds(&self) -> Vec<TaskKind> {
        let inner = self.lock();
        TaskKind::JOIN_ORDER
            .into_iter()
            .filter(|kind| {
                inner
                    .slots
                    .get(&TaskSlot::Session(*kind))
                    .is_some_and(|e| !e.handle.is_finished())
            })
            .collect()
    }

    /// How many times a slot has been spawned since the registry was made.
    pub fn spawn_count(&self, slot: TaskSlot) -> u32 {
        self.lock().spawn_counts.get(&slot).copied().unwrap_or(0)
    }

    /// Remove and return the handles for `slots`, in the given order.
    /// Retired handles of those slots come right after their live one.
    pub fn take(&self, slots: &[TaskSlot]) -> Vec<(TaskSlot, JoinHandle<()>)> {
        let mut inner = self.lock();
        let mut taken = Vec::new();
        for slot in slots {
            if let Some(entry) = inner.slots.remove(slot) {
                entry.token.cancel();
                taken.push((*slot, entry.handle));
            }
            let mut i = 0;
            while i < inner.retired.len() {
                if inner.retired[i].0 == *slot {
                    taken.push(inner.retired.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        taken
    }

    /// Remove and return every remaining handle: live slots first, then
    /// retired ones.
    pub fn take_all(&self) -> Vec<(TaskSlot, JoinHandle<()>)> {
        let mut inner = self.lock();
        let mut taken: Vec<_> = inner
            .slots
            .drain()
            .map(|(slot, entry)| {
                entry.token.cancel();
                (slot, entry.handle)
            })
            .collect();
        taken.append(&mut inner.retired);
        taken
    }

    /// Number of handles still owned by the registry.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.slots.len() + inner.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
