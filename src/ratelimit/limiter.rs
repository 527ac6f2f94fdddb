//! Throughput-limited task queue backed by a dedicated worker thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::error::{QueueError, Result};

use super::clock::{Clock, MonotonicClock};
use super::dispatch::{raise_on_worker, Dispatcher, ErrorHandler};
use super::task::{Runnable, Submission, TaskError, TaskHandle};
use super::window::SlidingWindow;

/// Default maximum admissions per window.
pub const DEFAULT_BURST_LIMIT: u32 = 30;
/// Default window width.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

/// Number of limiters created in this process, used for default names.
static INSTANCE_COUNT: AtomicUsize = AtomicUsize::new(0);

/// What travels through a limiter's channel.
enum Message {
    Task(Arc<dyn Runnable>),
    Shutdown,
}

/// State shared between limiter handles and the worker thread.
struct Core {
    name: String,
    burst_limit: u32,
    window: Duration,
    /// Next admission stage; tasks admitted here are forwarded instead of run
    parent: Option<RateLimiter>,
    clock: Arc<dyn Clock>,
    error_handler: RwLock<Option<ErrorHandler>>,
    dispatcher: RwLock<Option<Arc<dyn Dispatcher>>>,
    exit_requested: AtomicBool,
    /// Taken by the worker when it starts
    receiver: Mutex<Option<UnboundedReceiver<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    exited: Mutex<bool>,
    exit_signal: Condvar,
}

/// A named, independently running admission-controlled queue.
///
/// Tasks are pushed without blocking and consumed in FIFO order by one worker
/// thread, which admits at most roughly `burst_limit` of them per rolling
/// `window`. A limiter with a parent forwards admitted tasks to the parent's
/// queue for a second pass; a limiter without one executes them and routes
/// failures to its dispatcher or error handler.
///
/// Handles are cheap to clone. Once stopped, a limiter is terminal.
#[derive(Clone)]
pub struct RateLimiter {
    core: Arc<Core>,
    sender: UnboundedSender<Message>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.core.name)
            .field("burst_limit", &self.core.burst_limit)
            .field("window", &self.core.window)
            .field("parent", &self.core.parent.as_ref().map(|p| p.name()))
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl RateLimiter {
    /// Create and start a limiter admitting `burst_limit` tasks per `window`.
    pub fn new(burst_limit: u32, window: Duration) -> Result<Self> {
        Self::builder()
            .burst_limit(burst_limit)
            .window(window)
            .build()
    }

    /// Start configuring a limiter.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::new()
    }

    /// The limiter's name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Maximum admissions per window.
    pub fn burst_limit(&self) -> u32 {
        self.core.burst_limit
    }

    /// Width of the rolling window.
    pub fn window(&self) -> Duration {
        self.core.window
    }

    /// The limiter admitted tasks are forwarded to, if any.
    pub fn parent(&self) -> Option<&RateLimiter> {
        self.core.parent.as_ref()
    }

    /// Number of parent links above this limiter.
    pub(crate) fn depth(&self) -> usize {
        std::iter::successors(self.parent(), |limiter| limiter.parent()).count()
    }

    /// Whether the worker thread has been started and has not exited.
    pub fn is_alive(&self) -> bool {
        self.core
            .worker
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Start the worker thread. Starting a running limiter is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.core.exit_requested.load(Ordering::Acquire) {
            return Err(QueueError::NotRunning(self.core.name.clone()));
        }

        let mut worker = self.core.worker.lock();
        if let Some(handle) = worker.as_ref() {
            if handle.is_finished() {
                return Err(QueueError::NotRunning(self.core.name.clone()));
            }
            return Ok(());
        }

        let receiver = self
            .core
            .receiver
            .lock()
            .take()
            .ok_or_else(|| QueueError::NotRunning(self.core.name.clone()))?;

        let core = Arc::clone(&self.core);
        let handle = thread::Builder::new()
            .name(self.core.name.clone())
            .spawn(move || Worker::new(core, receiver).run())?;
        *worker = Some(handle);

        debug!(limiter = %self.core.name, "Limiter started");
        Ok(())
    }

    /// Queue a task and return its handle immediately.
    ///
    /// The submission must carry exactly one of a prebuilt handle or a
    /// callable.
    pub fn enqueue<T: Send + 'static>(&self, submission: Submission<T>) -> Result<TaskHandle<T>> {
        let handle = submission.into_handle()?;
        self.put(handle.as_runnable())?;
        Ok(handle)
    }

    /// Queue a callable.
    pub fn submit<T, F>(&self, func: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.enqueue(Submission::call(func))
    }

    pub(crate) fn put(&self, task: Arc<dyn Runnable>) -> Result<()> {
        if self.core.exit_requested.load(Ordering::Acquire) || !self.is_alive() {
            return Err(QueueError::NotRunning(self.core.name.clone()));
        }

        let id = task.id();
        self.sender
            .send(Message::Task(task))
            .map_err(|_| QueueError::NotRunning(self.core.name.clone()))?;

        trace!(limiter = %self.core.name, task = %id, "Task queued");
        Ok(())
    }

    /// Request shutdown and wait up to `timeout` (forever if `None`) for the
    /// worker to exit.
    ///
    /// Returns without error when the timeout elapses; use
    /// [`is_alive`](Self::is_alive) to check whether the worker terminated.
    /// A worker sleeping on a saturated window finishes that sleep first.
    pub fn stop(&self, timeout: Option<Duration>) {
        self.core.exit_requested.store(true, Ordering::Release);
        // Wakes a worker blocked on an empty queue; fails if it already exited.
        let _ = self.sender.send(Message::Shutdown);

        if self.core.worker.lock().is_none() {
            return;
        }

        debug!(limiter = %self.core.name, timeout = ?timeout, "Waiting for limiter to shut down");
        let finished = {
            let mut exited = self.core.exited.lock();
            match timeout {
                Some(timeout) => {
                    let deadline = Instant::now() + timeout;
                    while !*exited {
                        if self
                            .core
                            .exit_signal
                            .wait_until(&mut exited, deadline)
                            .timed_out()
                        {
                            break;
                        }
                    }
                }
                None => {
                    while !*exited {
                        self.core.exit_signal.wait(&mut exited);
                    }
                }
            }
            *exited
        };

        if !finished {
            debug!(limiter = %self.core.name, "Limiter still running after timeout");
            return;
        }

        let handle = self.core.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                debug!(limiter = %self.core.name, "Limiter worker had terminated abnormally");
            }
        }
        debug!(limiter = %self.core.name, "Limiter shut down");
    }

    /// Install the error handler used when no dispatcher is set.
    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.core.error_handler.write() = Some(handler);
    }

    /// Whether an explicit error handler is installed.
    pub fn has_error_handler(&self) -> bool {
        self.core.error_handler.read().is_some()
    }

    /// Route every executed task to `dispatcher`, bypassing the error handler.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.core.dispatcher.write() = Some(dispatcher);
    }

    /// Whether a dispatcher is installed.
    pub fn has_dispatcher(&self) -> bool {
        self.core.dispatcher.read().is_some()
    }
}

/// The consuming side of a limiter, owned by its worker thread.
struct Worker {
    core: Arc<Core>,
    receiver: UnboundedReceiver<Message>,
}

impl Worker {
    fn new(core: Arc<Core>, receiver: UnboundedReceiver<Message>) -> Self {
        Self { core, receiver }
    }

    fn run(mut self) {
        let mut window = SlidingWindow::new(self.core.burst_limit, self.core.window);
        debug!(limiter = %self.core.name, "Worker running");

        while let Some(message) = self.receiver.blocking_recv() {
            let task = match message {
                Message::Task(task) => task,
                Message::Shutdown => break,
            };

            if self.core.exit_requested.load(Ordering::Acquire) {
                self.core.cancel(&*task);
                break;
            }

            if let Some(delay) = window.admit(self.core.clock.now()) {
                trace!(
                    limiter = %self.core.name,
                    task = %task.id(),
                    delay_ms = delay.as_millis() as u64,
                    "Window saturated, delaying admission"
                );
                self.core.clock.sleep(delay.as_secs_f64());
            }

            self.core.dispatch(task);
        }
    }
}

impl Drop for Worker {
    // Runs on normal exit and while unwinding from the default error policy.
    fn drop(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            if let Message::Task(task) = message {
                self.core.cancel(&*task);
            }
        }

        *self.core.exited.lock() = true;
        self.core.exit_signal.notify_all();
        debug!(limiter = %self.core.name, "Worker exited");
    }
}

impl Core {
    fn dispatch(&self, task: Arc<dyn Runnable>) {
        match &self.parent {
            Some(parent) => {
                trace!(
                    limiter = %self.name,
                    parent = %parent.name(),
                    task = %task.id(),
                    "Forwarding task to parent"
                );
                if let Err(err) = parent.put(Arc::clone(&task)) {
                    warn!(
                        limiter = %self.name,
                        parent = %parent.name(),
                        task = %task.id(),
                        error = %err,
                        "Parent rejected forwarded task"
                    );
                    task.abort(TaskError::Forward {
                        limiter: self.name.clone(),
                        parent: parent.name().to_string(),
                    });
                    self.report(&*task);
                }
            }
            None => {
                trace!(limiter = %self.name, task = %task.id(), "Executing task");
                task.run();
                self.report(&*task);
            }
        }
    }

    fn report(&self, task: &dyn Runnable) {
        let dispatcher = self.dispatcher.read().clone();
        if let Some(dispatcher) = dispatcher {
            dispatcher.post_process(task);
            return;
        }

        let Some(err) = task.error() else {
            return;
        };
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => handler(&err),
            None => raise_on_worker(&self.name, &err),
        }
    }

    fn cancel(&self, task: &dyn Runnable) {
        warn!(limiter = %self.name, task = %task.id(), "Discarding task queued at shutdown");
        task.abort(TaskError::Cancelled(self.name.clone()));
    }
}

/// Builder for [`RateLimiter`].
pub struct LimiterBuilder {
    name: Option<String>,
    burst_limit: u32,
    window: Duration,
    parent: Option<RateLimiter>,
    error_handler: Option<ErrorHandler>,
    exc_route: Option<ErrorHandler>,
    autostart: bool,
    clock: Option<Arc<dyn Clock>>,
}

impl fmt::Debug for LimiterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterBuilder")
            .field("name", &self.name)
            .field("burst_limit", &self.burst_limit)
            .field("window", &self.window)
            .field("parent", &self.parent.as_ref().map(|p| p.name()))
            .field("autostart", &self.autostart)
            .finish_non_exhaustive()
    }
}

impl LimiterBuilder {
    /// Defaults: 30 tasks per 1000 ms, no parent, autostart.
    pub fn new() -> Self {
        Self {
            name: None,
            burst_limit: DEFAULT_BURST_LIMIT,
            window: DEFAULT_WINDOW,
            parent: None,
            error_handler: None,
            exc_route: None,
            autostart: true,
            clock: None,
        }
    }

    /// Name of the limiter and its worker thread. Defaults to `RateLimiter-N`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn burst_limit(mut self, burst_limit: u32) -> Self {
        self.burst_limit = burst_limit;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn window_ms(self, ms: u64) -> Self {
        self.window(Duration::from_millis(ms))
    }

    /// Forward admitted tasks to `parent` instead of executing them.
    pub fn parent(mut self, parent: RateLimiter) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    #[deprecated(note = "use `error_handler` instead")]
    pub fn exc_route(mut self, handler: ErrorHandler) -> Self {
        self.exc_route = Some(handler);
        self
    }

    /// Whether to start the worker as part of [`build`](Self::build).
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and create the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        if self.burst_limit == 0 {
            return Err(QueueError::Configuration(
                "burst_limit must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(QueueError::Configuration(
                "window must be greater than zero".to_string(),
            ));
        }
        if self.error_handler.is_some() && self.exc_route.is_some() {
            return Err(QueueError::Configuration(
                "only one of exc_route or error_handler can be passed".to_string(),
            ));
        }
        if self.exc_route.is_some() {
            warn!("exc_route is deprecated, use error_handler instead");
        }

        let count = INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        let name = self
            .name
            .unwrap_or_else(|| format!("RateLimiter-{}", count));

        let (sender, receiver) = mpsc::unbounded_channel();
        let core = Core {
            name,
            burst_limit: self.burst_limit,
            window: self.window,
            parent: self.parent,
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>),
            error_handler: RwLock::new(self.error_handler.or(self.exc_route)),
            dispatcher: RwLock::new(None),
            exit_requested: AtomicBool::new(false),
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
            exited: Mutex::new(false),
            exit_signal: Condvar::new(),
        };

        let limiter = RateLimiter {
            core: Arc::new(core),
            sender,
        };
        debug!(
            limiter = %limiter.name(),
            burst_limit = limiter.burst_limit(),
            window_ms = limiter.window().as_millis() as u64,
            parent = ?limiter.parent().map(|p| p.name()),
            "Limiter created"
        );

        if self.autostart {
            limiter.start()?;
        }
        Ok(limiter)
    }
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
