//! Routing of task outcomes out of terminal limiters.

use std::sync::Arc;

use tracing::error;

use super::task::{Runnable, TaskError};

/// Callable receiving the error of every failed task a limiter executes.
pub type ErrorHandler = Arc<dyn Fn(&TaskError) + Send + Sync>;

/// External receiver of executed tasks.
///
/// When a dispatcher is installed on a limiter it is handed every task the
/// limiter executes, failed or not, and the limiter's [`ErrorHandler`] is not
/// consulted.
pub trait Dispatcher: Send + Sync {
    /// Inspect a task after it ran.
    fn post_process(&self, task: &dyn Runnable);
}

/// Policy used when a limiter has neither a handler nor a dispatcher:
/// the error is raised on the worker thread, which terminates it.
pub(crate) fn raise_on_worker(limiter: &str, err: &TaskError) -> ! {
    error!(limiter = %limiter, error = %err, "Unhandled task error, stopping worker");
    panic!("unhandled task error in limiter {}: {}", limiter, err);
}

/// Wrap a closure as an [`ErrorHandler`].
pub fn error_handler<F>(f: F) -> ErrorHandler
where
    F: Fn(&TaskError) + Send + Sync + 'static,
{
    Arc::new(f)
}
