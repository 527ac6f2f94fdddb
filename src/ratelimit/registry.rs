//! Named collection of limiters with bulk lifecycle control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::error::{QueueError, Result};

use super::dispatch::{Dispatcher, ErrorHandler};
use super::limiter::{LimiterBuilder, RateLimiter};
use super::task::{Submission, TaskHandle};

/// Routes tasks to named [`RateLimiter`]s.
///
/// Created with two limiters: [`DEFAULT_LIMITER`](Self::DEFAULT_LIMITER) for
/// all traffic and [`GROUP_LIMITER`](Self::GROUP_LIMITER), a stricter limiter
/// chained to the default one, so group tasks pass both limits.
pub struct LimiterRegistry {
    /// Registered limiters by name
    limiters: RwLock<HashMap<String, RateLimiter>>,
    running: AtomicBool,
    /// Registry-wide handler, given to added limiters that lack one
    error_handler: Option<ErrorHandler>,
    dispatcher: RwLock<Option<Arc<dyn Dispatcher>>>,
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("limiters", &self.names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl LimiterRegistry {
    /// Name of the limiter applied to all traffic.
    pub const DEFAULT_LIMITER: &'static str = "default_limiter";
    /// Name of the stricter limiter chained to the default one.
    pub const GROUP_LIMITER: &'static str = "group_limiter";

    /// Create the registry and its two built-in limiters.
    pub fn new(config: &SchedulerConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Like [`new`](Self::new), with an error handler for every limiter.
    pub fn with_error_handler(config: &SchedulerConfig, handler: ErrorHandler) -> Result<Self> {
        Self::build(config, Some(handler))
    }

    fn build(config: &SchedulerConfig, error_handler: Option<ErrorHandler>) -> Result<Self> {
        config.validate()?;

        let with_handler = |builder: LimiterBuilder| match &error_handler {
            Some(handler) => builder.error_handler(Arc::clone(handler)),
            None => builder,
        };

        let default = with_handler(
            RateLimiter::builder()
                .name(Self::DEFAULT_LIMITER)
                .burst_limit(config.default_limiter.burst_limit)
                .window(config.default_limiter.window())
                .autostart(config.autostart),
        )
        .build()?;

        let group = with_handler(
            RateLimiter::builder()
                .name(Self::GROUP_LIMITER)
                .burst_limit(config.group_limiter.burst_limit)
                .window(config.group_limiter.window())
                .parent(default.clone())
                .autostart(config.autostart),
        )
        .build()?;

        let mut limiters = HashMap::new();
        limiters.insert(Self::DEFAULT_LIMITER.to_string(), default);
        limiters.insert(Self::GROUP_LIMITER.to_string(), group);

        info!(
            default_burst = config.default_limiter.burst_limit,
            default_window_ms = config.default_limiter.window_ms,
            group_burst = config.group_limiter.burst_limit,
            group_window_ms = config.group_limiter.window_ms,
            autostart = config.autostart,
            "Limiter registry created"
        );

        Ok(Self {
            limiters: RwLock::new(limiters),
            running: AtomicBool::new(config.autostart),
            error_handler,
            dispatcher: RwLock::new(None),
        })
    }

    /// Whether the registry has started its limiters.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The limiter registered under `name`.
    pub fn get(&self, name: &str) -> Option<RateLimiter> {
        self.limiters.read().get(name).cloned()
    }

    /// Names of all registered limiters, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register `limiter` under its own name.
    ///
    /// It is started if the registry is running, then the registry's
    /// dispatcher and error handler are installed on it. A limiter that
    /// cannot be registered is left untouched.
    pub fn add(&self, limiter: RateLimiter) -> Result<()> {
        let mut limiters = self.limiters.write();
        if limiters.contains_key(limiter.name()) {
            return Err(QueueError::Configuration(format!(
                "a limiter named {} is already registered",
                limiter.name()
            )));
        }

        if self.is_running() && !limiter.is_alive() {
            limiter.start()?;
        }
        if let Some(dispatcher) = self.dispatcher.read().clone() {
            limiter.set_dispatcher(dispatcher);
        }
        if let Some(handler) = &self.error_handler {
            if !limiter.has_error_handler() {
                limiter.set_error_handler(Arc::clone(handler));
            }
        }

        debug!(limiter = %limiter.name(), "Limiter registered");
        limiters.insert(limiter.name().to_string(), limiter);
        Ok(())
    }

    /// Unregister the limiter called `name`, stopping it if the registry is
    /// running.
    pub fn remove(&self, name: &str, timeout: Option<Duration>) -> Result<RateLimiter> {
        let limiter = self
            .limiters
            .write()
            .remove(name)
            .ok_or_else(|| QueueError::UnknownLimiter(name.to_string()))?;

        if self.is_running() && limiter.is_alive() {
            limiter.stop(timeout);
        }
        debug!(limiter = %name, "Limiter unregistered");
        Ok(limiter)
    }

    /// Start every registered limiter.
    pub fn start(&self) -> Result<()> {
        for limiter in self.snapshot() {
            limiter.start()?;
        }
        self.running.store(true, Ordering::Release);
        info!("Limiter registry started");
        Ok(())
    }

    /// Stop every registered limiter, one after another, each with `timeout`.
    ///
    /// Chained limiters are stopped before their parents.
    pub fn stop(&self, timeout: Option<Duration>) {
        let mut limiters = self.snapshot();
        limiters.sort_by_key(|limiter| std::cmp::Reverse(limiter.depth()));
        for limiter in limiters {
            limiter.stop(timeout);
        }
        self.running.store(false, Ordering::Release);
        info!("Limiter registry stopped");
    }

    /// Queue `func` on the limiter called `name`.
    pub fn route<T, F>(&self, name: &str, func: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.route_submission(name, Submission::call(func))
    }

    /// Queue a submission on the limiter called `name`.
    pub fn route_submission<T: Send + 'static>(
        &self,
        name: &str,
        submission: Submission<T>,
    ) -> Result<TaskHandle<T>> {
        let limiter = self
            .get(name)
            .ok_or_else(|| QueueError::UnknownLimiter(name.to_string()))?;
        limiter.enqueue(submission)
    }

    /// Route executed tasks of every current and future limiter to `dispatcher`.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        // Same lock order as `add`, so a concurrent add sees either the old
        // dispatcher and is updated here, or the new one.
        let limiters = self.limiters.write();
        *self.dispatcher.write() = Some(Arc::clone(&dispatcher));
        for limiter in limiters.values() {
            limiter.set_dispatcher(Arc::clone(&dispatcher));
        }
    }

    /// Clone the registered limiters so no lock is held while they block.
    fn snapshot(&self) -> Vec<RateLimiter> {
        self.limiters.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterSettings;
    use crate::ratelimit::dispatch::error_handler;
    use crate::ratelimit::task::{Runnable, TaskError};
    use parking_lot::Mutex;
    use std::time::Instant;

    fn config(default: (u32, u64), group: (u32, u64)) -> SchedulerConfig {
        SchedulerConfig {
            default_limiter: LimiterSettings::new(default.0, default.1),
            group_limiter: LimiterSettings::new(group.0, group.1),
            autostart: true,
        }
    }

    #[test]
    fn test_builtin_limiters() {
        let registry = LimiterRegistry::new(&SchedulerConfig::default()).unwrap();
        assert!(registry.is_running());
        assert_eq!(
            registry.names(),
            vec![LimiterRegistry::DEFAULT_LIMITER, LimiterRegistry::GROUP_LIMITER]
        );

        let default = registry.get(LimiterRegistry::DEFAULT_LIMITER).unwrap();
        assert_eq!(default.burst_limit(), 30);
        assert_eq!(default.window(), Duration::from_millis(1000));
        assert!(default.parent().is_none());

        let group = registry.get(LimiterRegistry::GROUP_LIMITER).unwrap();
        assert_eq!(group.burst_limit(), 20);
        assert_eq!(group.window(), Duration::from_secs(60));
        assert_eq!(
            group.parent().map(|p| p.name()),
            Some(LimiterRegistry::DEFAULT_LIMITER)
        );

        registry.stop(None);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = LimiterRegistry::new(&config((0, 1000), (20, 60_000))).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
    }

    #[test]
    fn test_route() {
        let registry = LimiterRegistry::new(&SchedulerConfig::default()).unwrap();

        let handle = registry
            .route(LimiterRegistry::DEFAULT_LIMITER, || Ok("sent"))
            .unwrap();
        assert_eq!(handle.wait().unwrap(), "sent");

        let group = registry
            .route(LimiterRegistry::GROUP_LIMITER, || Ok(2))
            .unwrap();
        assert_eq!(group.wait().unwrap(), 2);

        let unknown = registry.route("missing", || Ok(()));
        assert!(matches!(unknown, Err(QueueError::UnknownLimiter(_))));

        let invalid: Submission<()> = Submission::new();
        assert!(matches!(
            registry.route_submission(LimiterRegistry::DEFAULT_LIMITER, invalid),
            Err(QueueError::InvalidArguments)
        ));

        registry.stop(None);
    }

    #[test]
    fn test_route_after_stop_fails() {
        let registry = LimiterRegistry::new(&SchedulerConfig::default()).unwrap();
        registry.stop(Some(Duration::from_secs(1)));
        assert!(!registry.is_running());

        for name in [LimiterRegistry::DEFAULT_LIMITER, LimiterRegistry::GROUP_LIMITER] {
            assert!(matches!(
                registry.route(name, || Ok(())),
                Err(QueueError::NotRunning(_))
            ));
        }
    }

    #[test]
    fn test_group_traffic_bounded_by_both_limits() {
        let window = Duration::from_millis(200);
        // The default limiter is the tighter of the two here
        let registry = LimiterRegistry::new(&config((2, 200), (10, 200))).unwrap();

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| registry.route(LimiterRegistry::GROUP_LIMITER, || Ok(())).unwrap())
            .collect();
        for handle in &handles {
            handle.wait().unwrap();
        }
        assert!(start.elapsed() + Duration::from_millis(5) >= window);

        registry.stop(None);
    }

    #[test]
    fn test_group_limit_is_the_stricter_one() {
        let window = Duration::from_millis(300);
        let registry = LimiterRegistry::new(&config((100, 300), (2, 300))).unwrap();

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| registry.route(LimiterRegistry::GROUP_LIMITER, || Ok(())).unwrap())
            .collect();
        for handle in &handles {
            handle.wait().unwrap();
        }
        assert!(start.elapsed() + Duration::from_millis(5) >= window);

        // Default traffic is not held back by the group window
        let start = Instant::now();
        registry
            .route(LimiterRegistry::DEFAULT_LIMITER, || Ok(()))
            .unwrap()
            .wait()
            .unwrap();
        assert!(start.elapsed() < window);

        registry.stop(None);
    }

    #[test]
    fn test_deferred_start() {
        let mut cfg = SchedulerConfig::default();
        cfg.autostart = false;
        let registry = LimiterRegistry::new(&cfg).unwrap();
        assert!(!registry.is_running());
        assert!(matches!(
            registry.route(LimiterRegistry::DEFAULT_LIMITER, || Ok(())),
            Err(QueueError::NotRunning(_))
        ));

        registry.start().unwrap();
        assert!(registry.is_running());
        registry
            .route(LimiterRegistry::DEFAULT_LIMITER, || Ok(()))
            .unwrap()
            .wait()
            .unwrap();

        // Starting again leaves running limiters alone
        registry.start().unwrap();
        registry.stop(None);
    }

    #[test]
    fn test_add_and_remove() {
        let registry = LimiterRegistry::new(&SchedulerConfig::default()).unwrap();

        let extra = RateLimiter::builder()
            .name("uploads")
            .burst_limit(5)
            .autostart(false)
            .build()
            .unwrap();
        registry.add(extra.clone()).unwrap();
        // Added to a running registry, so started
        assert!(extra.is_alive());
        assert!(registry.names().contains(&"uploads".to_string()));
        registry.route("uploads", || Ok(())).unwrap().wait().unwrap();

        let duplicate = RateLimiter::builder()
            .name("uploads")
            .autostart(false)
            .build()
            .unwrap();
        assert!(matches!(
            registry.add(duplicate),
            Err(QueueError::Configuration(_))
        ));

        let removed = registry.remove("uploads", Some(Duration::from_secs(1))).unwrap();
        assert!(!removed.is_alive());
        assert!(registry.get("uploads").is_none());
        assert!(matches!(
            registry.route("uploads", || Ok(())),
            Err(QueueError::UnknownLimiter(_))
        ));
        assert!(matches!(
            registry.remove("uploads", None),
            Err(QueueError::UnknownLimiter(_))
        ));

        registry.stop(None);
    }

    #[test]
    fn test_failed_add_leaves_limiter_untouched() {
        let registry = LimiterRegistry::with_error_handler(
            &SchedulerConfig::default(),
            error_handler(|_| {}),
        )
        .unwrap();
        registry.set_dispatcher(Arc::new(Collector {
            failures: Mutex::new(0),
            total: Mutex::new(0),
        }));

        let stale = RateLimiter::builder().name("stale").build().unwrap();
        stale.stop(None);
        assert!(matches!(registry.add(stale.clone()), Err(QueueError::NotRunning(_))));
        assert!(!stale.has_dispatcher());
        assert!(!stale.has_error_handler());
        assert!(registry.get("stale").is_none());

        registry.stop(None);
    }

    #[test]
    fn test_add_to_stopped_registry_does_not_start() {
        let mut cfg = SchedulerConfig::default();
        cfg.autostart = false;
        let registry = LimiterRegistry::new(&cfg).unwrap();

        let extra = RateLimiter::builder()
            .name("idle")
            .autostart(false)
            .build()
            .unwrap();
        registry.add(extra.clone()).unwrap();
        assert!(!extra.is_alive());

        registry.start().unwrap();
        assert!(extra.is_alive());
        registry.stop(None);
        assert!(!extra.is_alive());
    }

    #[test]
    fn test_error_handler_propagation() {
        let errors = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = errors.clone();
        let registry = LimiterRegistry::with_error_handler(
            &SchedulerConfig::default(),
            error_handler(move |err| sink.lock().push(err.to_string())),
        )
        .unwrap();

        let extra = RateLimiter::builder()
            .name("reports")
            .autostart(false)
            .build()
            .unwrap();
        registry.add(extra.clone()).unwrap();
        assert!(extra.has_error_handler());

        let failed: TaskHandle<()> = registry
            .route("reports", || Err(anyhow::anyhow!("report failed")))
            .unwrap();
        assert!(matches!(failed.wait(), Err(TaskError::Failed(_))));
        let failed: TaskHandle<()> = registry
            .route(LimiterRegistry::GROUP_LIMITER, || Err(anyhow::anyhow!("group failed")))
            .unwrap();
        assert!(failed.wait().is_err());

        registry.stop(None);
        let errors = errors.lock();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("report failed")));
        assert!(errors.iter().any(|e| e.contains("group failed")));
    }

    struct Collector {
        failures: Mutex<usize>,
        total: Mutex<usize>,
    }

    impl Dispatcher for Collector {
        fn post_process(&self, task: &dyn Runnable) {
            *self.total.lock() += 1;
            if task.error().is_some() {
                *self.failures.lock() += 1;
            }
        }
    }

    #[test]
    fn test_dispatcher_propagation() {
        let registry = LimiterRegistry::new(&SchedulerConfig::default()).unwrap();
        let collector = Arc::new(Collector {
            failures: Mutex::new(0),
            total: Mutex::new(0),
        });
        registry.set_dispatcher(collector.clone());

        let extra = RateLimiter::builder().name("late").build().unwrap();
        registry.add(extra).unwrap();

        let a: TaskHandle<()> = registry
            .route(LimiterRegistry::DEFAULT_LIMITER, || Err(anyhow::anyhow!("x")))
            .unwrap();
        let b = registry.route(LimiterRegistry::GROUP_LIMITER, || Ok(())).unwrap();
        let c: TaskHandle<()> = registry.route("late", || Err(anyhow::anyhow!("y"))).unwrap();
        assert!(a.wait().is_err());
        b.wait().unwrap();
        assert!(c.wait().is_err());

        registry.stop(None);
        // Group tasks are executed, and reported, by the default limiter only
        assert_eq!(*collector.total.lock(), 3);
        assert_eq!(*collector.failures.lock(), 2);
    }

    #[test]
    fn test_dispatcher_reaches_concurrently_added_limiters() {
        let mut cfg = SchedulerConfig::default();
        cfg.autostart = false;
        let registry = Arc::new(LimiterRegistry::new(&cfg).unwrap());

        let adders: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let limiter = RateLimiter::builder()
                            .name(format!("extra-{}-{}", t, i))
                            .autostart(false)
                            .build()
                            .unwrap();
                        registry.add(limiter).unwrap();
                    }
                })
            })
            .collect();
        registry.set_dispatcher(Arc::new(Collector {
            failures: Mutex::new(0),
            total: Mutex::new(0),
        }));
        for adder in adders {
            adder.join().unwrap();
        }

        let names = registry.names();
        assert_eq!(names.len(), 102);
        for name in names {
            assert!(registry.get(&name).unwrap().has_dispatcher(), "{} has no dispatcher", name);
        }
    }
}
