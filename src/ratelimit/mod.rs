//! Sliding-window limiters and the registry that routes tasks to them.

mod clock;
mod dispatch;
mod limiter;
mod registry;
mod task;
mod window;

pub use clock::{Clock, MonotonicClock};
pub use dispatch::{error_handler, Dispatcher, ErrorHandler};
pub use limiter::{LimiterBuilder, RateLimiter, DEFAULT_BURST_LIMIT, DEFAULT_WINDOW};
pub use registry::LimiterRegistry;
pub use task::{Runnable, Submission, TaskError, TaskFn, TaskHandle};
pub use window::SlidingWindow;
