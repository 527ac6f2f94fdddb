//! Deferred units of work and their outcomes.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use uuid::Uuid;

/// Boxed callable executed by a limiter worker.
pub type TaskFn<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>;

/// Why a task did not produce a value.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    /// The callable returned an error
    #[error("task failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The callable panicked
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A chained limiter could not hand the task to its parent
    #[error("limiter {limiter} could not forward task to parent {parent}")]
    Forward { limiter: String, parent: String },

    /// The limiter shut down before the task was admitted
    #[error("limiter {0} shut down before the task ran")]
    Cancelled(String),
}

/// Type-erased view of a task, as queued and dispatched by limiters.
pub trait Runnable: Send + Sync {
    /// Unique identifier of the task.
    fn id(&self) -> Uuid;

    /// Execute the callable, capturing its outcome. Running twice is a no-op.
    fn run(&self);

    /// Whether the task has an outcome.
    fn is_done(&self) -> bool;

    /// The captured error, if the task failed.
    fn error(&self) -> Option<TaskError>;

    /// Complete the task with `error` without running it.
    fn abort(&self, error: TaskError);
}

enum TaskState<T> {
    Pending,
    Done(T),
    Failed(TaskError),
}

struct TaskCell<T> {
    id: Uuid,
    func: Mutex<Option<TaskFn<T>>>,
    state: Mutex<TaskState<T>>,
    finished: Condvar,
}

impl<T> TaskCell<T> {
    fn complete(&self, outcome: TaskState<T>) {
        let mut state = self.state.lock();
        if matches!(*state, TaskState::Pending) {
            *state = outcome;
            self.finished.notify_all();
        }
    }
}

impl<T: Send + 'static> Runnable for TaskCell<T> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn run(&self) {
        let Some(func) = self.func.lock().take() else {
            return;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(func)) {
            Ok(Ok(value)) => TaskState::Done(value),
            Ok(Err(err)) => TaskState::Failed(TaskError::Failed(Arc::new(err))),
            Err(payload) => TaskState::Failed(TaskError::Panicked(panic_message(&*payload))),
        };
        self.complete(outcome);
    }

    fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), TaskState::Pending)
    }

    fn error(&self) -> Option<TaskError> {
        match &*self.state.lock() {
            TaskState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    fn abort(&self, error: TaskError) {
        self.func.lock().take();
        self.complete(TaskState::Failed(error));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Shared handle to a deferred task and its eventual outcome.
///
/// Cloning the handle is cheap; every clone observes the same outcome.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.cell.state.lock() {
            TaskState::Pending => "pending",
            TaskState::Done(_) => "done",
            TaskState::Failed(_) => "failed",
        };
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id)
            .field("state", &state)
            .finish()
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Wrap a callable in a new pending task.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            cell: Arc::new(TaskCell {
                id: Uuid::new_v4(),
                func: Mutex::new(Some(Box::new(func))),
                state: Mutex::new(TaskState::Pending),
                finished: Condvar::new(),
            }),
        }
    }

    /// Unique identifier of the task.
    pub fn id(&self) -> Uuid {
        self.cell.id
    }

    /// Execute the task on the current thread.
    pub fn run(&self) {
        self.cell.run();
    }

    /// Whether the task has an outcome.
    pub fn is_done(&self) -> bool {
        self.cell.is_done()
    }

    /// The captured error, if the task failed.
    pub fn error(&self) -> Option<TaskError> {
        self.cell.error()
    }

    pub(crate) fn as_runnable(&self) -> Arc<dyn Runnable> {
        self.cell.clone()
    }
}

impl<T: Clone + Send + 'static> TaskHandle<T> {
    /// Block until the task has an outcome and return it.
    pub fn wait(&self) -> Result<T, TaskError> {
        let mut state = self.cell.state.lock();
        while matches!(*state, TaskState::Pending) {
            self.cell.finished.wait(&mut state);
        }
        Self::outcome(&state)
    }

    /// Block for at most `timeout`; `None` if the task is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        let mut state = self.cell.state.lock();
        if matches!(*state, TaskState::Pending) {
            self.cell.finished.wait_for(&mut state, timeout);
        }
        match *state {
            TaskState::Pending => None,
            _ => Some(Self::outcome(&state)),
        }
    }

    fn outcome(state: &TaskState<T>) -> Result<T, TaskError> {
        match state {
            TaskState::Done(value) => Ok(value.clone()),
            TaskState::Failed(err) => Err(err.clone()),
            TaskState::Pending => unreachable!("outcome read before completion"),
        }
    }
}

/// What a producer hands to [`RateLimiter::enqueue`](super::RateLimiter::enqueue):
/// exactly one of a prebuilt handle or a callable.
pub struct Submission<T> {
    pub(crate) handle: Option<TaskHandle<T>>,
    pub(crate) func: Option<TaskFn<T>>,
}

impl<T: Send + 'static> Submission<T> {
    /// An empty submission. Must be given a handle or a callable before use.
    pub fn new() -> Self {
        Self {
            handle: None,
            func: None,
        }
    }

    /// Submit a callable.
    pub fn call<F>(func: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::new().func(func)
    }

    /// Submit an existing handle.
    pub fn handle(handle: TaskHandle<T>) -> Self {
        Self::new().with_handle(handle)
    }

    /// Set the callable.
    pub fn func<F>(mut self, func: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.func = Some(Box::new(func));
        self
    }

    /// Set the prebuilt handle.
    pub fn with_handle(mut self, handle: TaskHandle<T>) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Resolve into the handle to queue, rejecting ambiguous submissions.
    pub(crate) fn into_handle(self) -> crate::error::Result<TaskHandle<T>> {
        match (self.handle, self.func) {
            (Some(handle), None) => Ok(handle),
            (None, Some(func)) => Ok(TaskHandle::new(func)),
            _ => Err(crate::error::QueueError::InvalidArguments),
        }
    }
}

impl<T: Send + 'static> Default for Submission<T> {
    fn default() -> Self {
        Self::new()
    }
}
