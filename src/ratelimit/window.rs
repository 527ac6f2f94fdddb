//! Sliding-window admission control.

use std::time::Duration;

/// Initial timestamp capacity; the buffer grows under load.
const INITIAL_CAPACITY: usize = 64;

/// Timestamps of the most recent admissions of a single limiter.
///
/// Owned exclusively by that limiter's worker thread, so no interior
/// synchronization is needed. The delay computed by [`admit`](Self::admit)
/// uses the second-oldest timestamp still inside the window as the wake
/// reference, which keeps admissions at or near `burst_limit` per window
/// without being an exact token bucket.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    /// Maximum admissions per window
    burst_limit: usize,
    /// Window width in seconds
    window: f64,
    /// Window width as given
    width: Duration,
    /// Admission timestamps, oldest first
    times: Vec<f64>,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new(burst_limit: u32, window: Duration) -> Self {
        Self {
            burst_limit: burst_limit.max(1) as usize,
            window: window.as_secs_f64(),
            width: window,
            times: Vec::with_capacity((burst_limit as usize).min(INITIAL_CAPACITY)),
        }
    }

    /// Record an admission at `now` and return how long the caller must wait
    /// before dispatching, if the window is saturated.
    pub fn admit(&mut self, now: f64) -> Option<Duration> {
        let cutoff = now - self.window;

        match self.times.last() {
            // The previous window fully elapsed; start over.
            Some(&last) if last < cutoff => {
                self.times.clear();
                self.times.push(now);
            }
            _ => {
                self.times.retain(|&t| t >= cutoff);
                self.times.push(now);
            }
        }

        if self.times.len() < self.burst_limit {
            return None;
        }

        // A burst limit of 1 leaves a single entry; wait out a whole window.
        let reference = self.times[1.min(self.times.len() - 1)];
        let delay = (reference - cutoff).max(0.0);
        Some(Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX))
    }

    /// Number of admissions currently remembered.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether no admissions are remembered.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// The remembered admission timestamps, oldest first.
    pub fn timestamps(&self) -> &[f64] {
        &self.times
    }

    /// Maximum admissions per window.
    pub fn burst_limit(&self) -> usize {
        self.burst_limit
    }

    /// Window width.
    pub fn window(&self) -> Duration {
        self.width
    }
}
