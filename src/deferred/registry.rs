//! Registry of deferred tasks.
//!
//! # Responsibilities
//! - Accept registrations from any request handler, concurrently
//! - Spawn each task's runner and drive its state transitions
//! - Count outstanding tasks and notify when the count reaches zero
//! - Abandon everything still open once shutdown closes the registry
//!
//! # Design Decisions
//! - Entries are reaped on their terminal transition; handles keep the final state
//! - Admission is a read/write lock: registrations hold it for read, `close`
//!   takes it for write, so no registration can slip past the close sweep
//! - Transition calls on unknown or settled tasks are logged and ignored

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::deferred::task::{panic_message, TaskHandle, TaskId, TaskResult, TaskSnapshot, TaskState};
use crate::observability::metrics;

/// Whether the registry still takes new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal operation.
    Open,
    /// Shutdown is waiting on outstanding tasks; registrations still accepted.
    Draining,
    /// Process is terminating; registrations are abandoned on arrival.
    Closed,
}

/// Errors returned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// `await_all_settled` may only be called once per registry.
    #[error("deferred task drain was already claimed")]
    DrainAlreadyClaimed,
}

/// Result of waiting for outstanding tasks.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
    /// Every task reached a terminal state.
    Drained,
    /// The deadline passed first. Holds the tasks that were still open.
    TimedOut { remaining: Vec<TaskSnapshot> },
}

struct TaskEntry {
    owner: String,
    label: String,
    state: watch::Sender<TaskState>,
    error: Arc<OnceLock<String>>,
    registered_at: Instant,
    abort: Option<AbortHandle>,
}

impl TaskEntry {
    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            owner: self.owner.clone(),
            label: self.label.clone(),
            state: *self.state.borrow(),
            error: self.error.get().cloned(),
            age: self.registered_at.elapsed(),
        }
    }
}

struct Inner {
    tasks: DashMap<TaskId, TaskEntry>,
    outstanding: watch::Sender<usize>,
    admission: RwLock<Admission>,
    drain_claimed: AtomicBool,
}

/// Shared registry of deferred tasks. Cheap to clone.
#[derive(Clone)]
pub struct DeferredRegistry {
    inner: Arc<Inner>,
}

impl DeferredRegistry {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                tasks: DashMap::new(),
                outstanding,
                admission: RwLock::new(Admission::Open),
                drain_claimed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a task that may start right away.
    pub fn register<F, Fut>(&self, owner: impl Into<String>, label: impl Into<String>, action: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register_after(owner, label, std::future::ready(()), action)
    }

    /// Register a task that starts once `gate` resolves.
    ///
    /// The HTTP layer passes a gate that resolves when the response is ready,
    /// so the action runs after the response rather than alongside the handler.
    /// Must be called from within a Tokio runtime.
    pub fn register_after<G, F, Fut>(
        &self,
        owner: impl Into<String>,
        label: impl Into<String>,
        gate: G,
        action: F,
    ) -> TaskHandle
    where
        G: Future<Output = ()> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let id = TaskId::next();
        let owner = owner.into();
        let label = label.into();
        let (state_tx, state_rx) = watch::channel(TaskState::Pending);
        let error = Arc::new(OnceLock::new());
        let handle = TaskHandle::new(id, state_rx, error.clone());

        let admission = self.inner.admission.read().unwrap_or_else(PoisonError::into_inner);
        if *admission == Admission::Closed {
            state_tx.send_replace(TaskState::Abandoned);
            tracing::warn!(
                task_id = %id,
                owner = %owner,
                label = %label,
                "deferred task abandoned: registered after shutdown began"
            );
            metrics::record_task_settled("abandoned");
            return handle;
        }

        let span = tracing::info_span!("deferred_task", task_id = %id, owner = %owner, label = %label);
        tracing::debug!(
            task_id = %id,
            owner = %owner,
            label = %label,
            admission = ?*admission,
            "deferred task registered"
        );

        // Counted before the entry is visible to any transition.
        self.inner.outstanding.send_modify(|n| *n += 1);
        self.inner.tasks.insert(
            id,
            TaskEntry {
                owner,
                label,
                state: state_tx,
                error,
                registered_at: Instant::now(),
                abort: None,
            },
        );
        metrics::record_task_registered();
        metrics::set_outstanding_tasks(self.outstanding_count());

        let runner = self.clone().run_task(id, gate, action).instrument(span);
        let join = tokio::spawn(runner);

        // The runner may already have settled and been reaped.
        if let Some(mut entry) = self.inner.tasks.get_mut(&id) {
            entry.abort = Some(join.abort_handle());
        }

        drop(admission);
        handle
    }

    async fn run_task<G, F, Fut>(self, id: TaskId, gate: G, action: F)
    where
        G: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = TaskResult>,
    {
        gate.await;
        if !self.mark_running(id) {
            return;
        }

        let outcome = AssertUnwindSafe(async move { action().await })
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(payload) => Some(panic_message(payload).into_owned()),
        };
        self.mark_completed(id, error);
    }

    /// Pending → Running.
    pub fn mark_running(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Running, None)
    }

    /// Running → Completed, recording the action's error if it failed.
    pub fn mark_completed(&self, id: TaskId, error: Option<String>) -> bool {
        self.transition(id, TaskState::Completed, error)
    }

    /// Pending/Running → Abandoned. Aborts the runner.
    pub fn mark_abandoned(&self, id: TaskId) -> bool {
        self.transition(id, TaskState::Abandoned, None)
    }

    fn transition(&self, id: TaskId, next: TaskState, error: Option<String>) -> bool {
        let Some(mut entry) = self.inner.tasks.get_mut(&id) else {
            tracing::debug!(task_id = %id, to = %next, "Ignoring transition for unknown or settled task");
            return false;
        };

        let current = *entry.state.borrow();
        if !current.can_transition_to(next) {
            tracing::debug!(task_id = %id, from = %current, to = %next, "Ignoring illegal task transition");
            return false;
        }

        // Error first, so a waiter woken by the state change can read it.
        if let Some(error) = error {
            let _ = entry.error.set(error);
        }
        entry.state.send_replace(next);

        if next == TaskState::Running {
            tracing::info!(task_id = %id, owner = %entry.owner, label = %entry.label, "deferred task started");
            return true;
        }

        if next == TaskState::Abandoned {
            if let Some(abort) = entry.abort.take() {
                abort.abort();
            }
        }
        let snapshot = entry.snapshot(id);
        drop(entry);

        // Terminal: the registry no longer owns the task.
        self.inner.tasks.remove(&id);
        self.inner.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        metrics::set_outstanding_tasks(self.outstanding_count());
        log_settled(&snapshot, current);
        true
    }

    /// Wait until every registered task has settled or `deadline` passes.
    ///
    /// Only the first call waits; later calls return [`RegistryError::DrainAlreadyClaimed`].
    pub async fn await_all_settled(&self, deadline: Instant) -> Result<DrainOutcome, RegistryError> {
        if self.inner.drain_claimed.swap(true, Ordering::SeqCst) {
            return Err(RegistryError::DrainAlreadyClaimed);
        }

        let mut settled = self.inner.outstanding.subscribe();
        // A closed channel is impossible while `self` holds the sender.
        let drained = tokio::time::timeout_at(deadline, settled.wait_for(|n| *n == 0))
            .await
            .is_ok();

        if drained {
            Ok(DrainOutcome::Drained)
        } else {
            Ok(DrainOutcome::TimedOut {
                remaining: self.snapshot(),
            })
        }
    }

    /// Number of tasks not yet settled. For logging and metrics only.
    pub fn outstanding_count(&self) -> usize {
        *self.inner.outstanding.borrow()
    }

    /// Snapshots of all open tasks, ordered by ID.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let mut tasks: Vec<TaskSnapshot> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot(*entry.key()))
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    /// Snapshot of one open task.
    pub fn task(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.inner.tasks.get(&id).map(|entry| entry.snapshot(id))
    }

    pub fn admission(&self) -> Admission {
        *self.inner.admission.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open → Draining. Registrations keep being accepted.
    pub fn begin_draining(&self) {
        let mut admission = self.inner.admission.write().unwrap_or_else(PoisonError::into_inner);
        if *admission == Admission::Open {
            *admission = Admission::Draining;
        }
    }

    /// Stop admitting tasks and abandon every open one.
    ///
    /// Returns how many tasks this call abandoned; a repeated call returns 0.
    pub fn close(&self) -> usize {
        {
            let mut admission = self.inner.admission.write().unwrap_or_else(PoisonError::into_inner);
            *admission = Admission::Closed;
        }

        let ids: Vec<TaskId> = self.inner.tasks.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.mark_abandoned(*id)).count()
    }
}

impl Default for DeferredRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn log_settled(task: &TaskSnapshot, from: TaskState) {
    let age_ms = task.age.as_millis() as u64;
    match (task.state, &task.error) {
        (TaskState::Completed, None) => {
            tracing::info!(
                task_id = %task.id,
                owner = %task.owner,
                label = %task.label,
                age_ms,
                outcome = "ok",
                "deferred task finished"
            );
            metrics::record_task_settled("ok");
        }
        (TaskState::Completed, Some(error)) => {
            tracing::warn!(
                task_id = %task.id,
                owner = %task.owner,
                label = %task.label,
                age_ms,
                outcome = "failed",
                error = %error,
                "deferred task finished"
            );
            metrics::record_task_settled("failed");
        }
        _ => {
            tracing::warn!(
                task_id = %task.id,
                owner = %task.owner,
                label = %task.label,
                age_ms,
                was = %from,
                "deferred task abandoned"
            );
            metrics::record_task_settled("abandoned");
        }
    }
}
