//! Time source used by the limiter workers.

use std::time::{Duration, Instant};

/// A monotonic time source measured in seconds.
///
/// Workers read the current time and sleep through this trait so the sliding
/// window can be driven deterministically.
pub trait Clock: Send + Sync {
    /// Seconds elapsed since the clock's origin.
    fn now(&self) -> f64;

    /// Block the calling thread for `secs` seconds.
    fn sleep(&self, secs: f64);
}

/// Wall-clock implementation backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, secs: f64) {
        if secs > 0.0 {
            std::thread::sleep(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX));
        }
    }
}

/// Manually driven clock; sleeping advances time instantly.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: parking_lot::Mutex<f64>,
    sleeps: parking_lot::Mutex<Vec<f64>>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }

    /// Every sleep requested so far, in order.
    pub(crate) fn sleeps(&self) -> Vec<f64> {
        self.sleeps.lock().clone()
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }

    fn sleep(&self, secs: f64) {
        self.sleeps.lock().push(secs);
        if secs > 0.0 {
            self.advance(secs);
        }
    }
}
