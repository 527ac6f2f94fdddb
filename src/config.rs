//! Configuration management for the limiter registry.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{QueueError, Result};

/// Top-level configuration for a [`LimiterRegistry`](crate::ratelimit::LimiterRegistry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Limits applied to all traffic
    #[serde(default = "default_limiter_settings")]
    pub default_limiter: LimiterSettings,

    /// Stricter limits for the group sub-category, chained to the default limiter
    #[serde(default = "group_limiter_settings")]
    pub group_limiter: LimiterSettings,

    /// Whether the built-in limiters start their workers immediately
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_limiter: default_limiter_settings(),
            group_limiter: group_limiter_settings(),
            autostart: default_autostart(),
        }
    }
}

/// Throughput limits for a single limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum number of admissions per window
    pub burst_limit: u32,

    /// Width of the rolling window in milliseconds
    pub window_ms: u64,
}

impl LimiterSettings {
    /// Create settings from a burst limit and window width.
    pub fn new(burst_limit: u32, window_ms: u64) -> Self {
        Self {
            burst_limit,
            window_ms,
        }
    }

    /// The window width as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Check that both limits are positive.
    pub fn validate(&self) -> Result<()> {
        if self.burst_limit == 0 {
            return Err(QueueError::Configuration(
                "burst_limit must be greater than zero".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(QueueError::Configuration(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_limiter_settings() -> LimiterSettings {
    LimiterSettings::new(30, 1000)
}

fn group_limiter_settings() -> LimiterSettings {
    LimiterSettings::new(20, 60_000)
}

fn default_autostart() -> bool {
    true
}

impl SchedulerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading scheduler configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SchedulerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QueueError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate both built-in limiter settings.
    pub fn validate(&self) -> Result<()> {
        self.default_limiter.validate()?;
        self.group_limiter.validate()
    }
}
