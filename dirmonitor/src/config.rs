//! Configuration types for directory monitors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

/// Default size of the staged raw event buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64512;

/// Smallest buffer that still fits one maximal inotify record.
pub const MIN_BUFFER_CAPACITY: usize = 4096;

/// Configuration for a [`Monitor`](crate::Monitor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Backend to use (None = platform default).
    pub backend: Option<String>,

    /// Capacity of the raw event buffer in bytes.
    pub buffer_capacity: usize,

    /// Interval between scans for polling backends, in milliseconds.
    pub poll_interval_ms: u64,

    /// Pause after an empty native read, in milliseconds.
    pub idle_backoff_ms: u64,

    /// Name given to the collection thread.
    pub thread_name: String,
}

impl MonitorConfig {
    /// Create a config using the platform default backend.
    pub fn new() -> Self {
        Self {
            backend: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            poll_interval_ms: 500,
            idle_backoff_ms: 1,
            thread_name: "dirmonitor".to_string(),
        }
    }

    /// Select a backend by name.
    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = Some(name.into());
        self
    }

    /// Set the raw buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the polling interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the name of the collection thread.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Polling interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Back-off after an empty read as a duration.
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity < MIN_BUFFER_CAPACITY {
            return Err(MonitorError::Config(format!(
                "buffer_capacity must be at least {MIN_BUFFER_CAPACITY} bytes, got {}",
                self.buffer_capacity
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(MonitorError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.backend.as_deref() == Some("") {
            return Err(MonitorError::Config("backend name is empty".to_string()));
        }

        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a backend keeps one watch or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    /// Each new watch replaces the previous one.
    Single,

    /// Watches accumulate independently.
    Multiple,
}

impl WatchMode {
    /// Name as reported to hosts.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multiple => "multiple",
        }
    }
}

impl std::fmt::Display for WatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_monitor_config_creation() {
        let config = MonitorConfig::new()
            .with_backend("dummy")
            .with_buffer_capacity(8192)
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.backend.as_deref(), Some("dummy"));
        assert_eq!(config.buffer_capacity, 8192);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_buffer() {
        let config = MonitorConfig::new().with_buffer_capacity(16);
        assert!(matches!(config.validate(), Err(MonitorError::Config(_))));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: MonitorConfig = serde_json::from_str(r#"{"backend":"inotify"}"#).unwrap();
        assert_eq!(config.backend.as_deref(), Some("inotify"));
        assert_eq!(config.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.thread_name, "dirmonitor");
    }

    #[test]
    fn test_watch_mode_names() {
        assert_eq!(WatchMode::Single.to_string(), "single");
        assert_eq!(WatchMode::Multiple.as_str(), "multiple");
    }
}
