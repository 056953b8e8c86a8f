//! Deferred task identity, state and handles.

use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

/// Error type returned by deferred actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by deferred actions.
pub type TaskResult = Result<(), BoxError>;

/// Global counter for task IDs. Only uniqueness matters, so relaxed is enough.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a deferred task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next task ID.
    pub(crate) fn next() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle state of a deferred task.
///
/// ```text
/// Pending → Running → Completed
///    │         │
///    └─────────┴────→ Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Registered, waiting for its response to be sent.
    Pending,
    /// Action is executing.
    Running,
    /// Action returned (successfully or with an error).
    Completed,
    /// Action was never started or was cut off by shutdown.
    Abandoned,
}

impl TaskState {
    /// Completed and Abandoned are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Abandoned)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running)
                | (TaskState::Pending, TaskState::Abandoned)
                | (TaskState::Running, TaskState::Completed)
                | (TaskState::Running, TaskState::Abandoned)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a task, used for logging and inspection.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub owner: String,
    pub label: String,
    pub state: TaskState,
    /// Error recorded when the action failed or panicked.
    pub error: Option<String>,
    /// Time since registration.
    pub age: Duration,
}

impl TaskSnapshot {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Handle returned to the code that registered a task.
///
/// Registrants are not required to hold or await it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    state: watch::Receiver<TaskState>,
    error: Arc<OnceLock<String>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, state: watch::Receiver<TaskState>, error: Arc<OnceLock<String>>) -> Self {
        Self { id, state, error }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state of the task.
    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Error recorded when the action failed or panicked.
    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    /// Wait until the task has left Pending.
    pub async fn started(&mut self) -> TaskState {
        self.wait_until(|s| *s != TaskState::Pending).await
    }

    /// Wait until the task reaches a terminal state and return it.
    pub async fn wait(&mut self) -> TaskState {
        self.wait_until(TaskState::is_terminal).await
    }

    async fn wait_until(&mut self, pred: impl FnMut(&TaskState) -> bool) -> TaskState {
        let reached = self.state.wait_for(pred).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            // The sender is dropped once the entry is reaped; the last value is final.
            Err(_) => *self.state.borrow(),
        }
    }
}

/// Render a panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> Cow<'static, str> {
    match payload.downcast::<String>() {
        Ok(owned) => Cow::Owned(format!("task panicked: {owned}")),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => Cow::Owned(format!("task panicked: {msg}")),
            Err(_) => Cow::Borrowed("task panicked"),
        },
    }
}
