//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::clock::{millis, Nsecs};

/// Dispatcher timing and behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Delay before the first synthetic repeat of a held key (ms)
    #[serde(default = "default_key_repeat_timeout_ms")]
    pub key_repeat_timeout_ms: u64,

    /// Delay between subsequent synthetic repeats (ms)
    #[serde(default = "default_key_repeat_delay_ms")]
    pub key_repeat_delay_ms: u64,

    /// Maximum rate of throttled MOVE events per device
    #[serde(default = "default_max_events_per_second")]
    pub max_events_per_second: u32,

    /// Not-ready wait before declaring ANR, when neither window nor
    /// application specifies one (ms)
    #[serde(default = "default_dispatching_timeout_ms")]
    pub default_dispatching_timeout_ms: u64,

    /// How long after an app-switch key UP pending events are dropped (ms)
    #[serde(default = "default_app_switch_timeout_ms")]
    pub app_switch_timeout_ms: u64,

    /// Age after which a key or motion is dropped as stale (ms)
    #[serde(default = "default_stale_event_timeout_ms")]
    pub stale_event_timeout_ms: u64,

    /// Batched MOVE samples closer than this overwrite the last sample (ms)
    #[serde(default = "default_motion_sample_coalesce_interval_ms")]
    pub motion_sample_coalesce_interval_ms: u64,

    /// Synthesize repeats for held keys
    #[serde(default = "default_true")]
    pub key_repeat_enabled: bool,
}

fn default_key_repeat_timeout_ms() -> u64 {
    500
}

fn default_key_repeat_delay_ms() -> u64 {
    50
}

fn default_max_events_per_second() -> u32 {
    60
}

fn default_dispatching_timeout_ms() -> u64 {
    5000
}

fn default_app_switch_timeout_ms() -> u64 {
    500
}

fn default_stale_event_timeout_ms() -> u64 {
    10_000
}

fn default_motion_sample_coalesce_interval_ms() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn ms(value: u64) -> Nsecs {
    millis(i64::try_from(value).unwrap_or(i64::MAX / 1_000_000))
}

impl DispatcherConfig {
    /// Key repeat timeout in nanoseconds.
    pub fn key_repeat_timeout(&self) -> Nsecs {
        ms(self.key_repeat_timeout_ms)
    }

    /// Key repeat delay in nanoseconds.
    pub fn key_repeat_delay(&self) -> Nsecs {
        ms(self.key_repeat_delay_ms)
    }

    /// Minimum spacing of throttled MOVE events in nanoseconds.
    pub fn min_time_between_events(&self) -> Nsecs {
        1_000_000_000 / Nsecs::from(self.max_events_per_second.max(1))
    }

    /// Default dispatching timeout in nanoseconds.
    pub fn default_dispatching_timeout(&self) -> Nsecs {
        ms(self.default_dispatching_timeout_ms)
    }

    /// App switch timeout in nanoseconds.
    pub fn app_switch_timeout(&self) -> Nsecs {
        ms(self.app_switch_timeout_ms)
    }

    /// Stale event timeout in nanoseconds.
    pub fn stale_event_timeout(&self) -> Nsecs {
        ms(self.stale_event_timeout_ms)
    }

    /// Sample coalescing interval in nanoseconds.
    pub fn motion_sample_coalesce_interval(&self) -> Nsecs {
        ms(self.motion_sample_coalesce_interval_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            key_repeat_timeout_ms: default_key_repeat_timeout_ms(),
            key_repeat_delay_ms: default_key_repeat_delay_ms(),
            max_events_per_second: default_max_events_per_second(),
            default_dispatching_timeout_ms: default_dispatching_timeout_ms(),
            app_switch_timeout_ms: default_app_switch_timeout_ms(),
            stale_event_timeout_ms: default_stale_event_timeout_ms(),
            motion_sample_coalesce_interval_ms: default_motion_sample_coalesce_interval_ms(),
            key_repeat_enabled: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files (None = console only)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Print dispatcher statistics at shutdown
    #[serde(default = "default_true")]
    pub statistics: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_dir: None,
            statistics: true,
        }
    }
}
