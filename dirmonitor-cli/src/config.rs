//! Monitor settings from an optional TOML file plus command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};
use dirmonitor::MonitorConfig;

/// Read `path` if given, otherwise start from defaults.
pub fn load(path: Option<&Path>) -> Result<MonitorConfig> {
    let Some(path) = path else {
        return Ok(MonitorConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
}

/// Apply flag values on top of the file settings.
pub fn apply_overrides(
    mut config: MonitorConfig,
    backend: Option<String>,
    poll_interval_ms: Option<u64>,
) -> Result<MonitorConfig> {
    if backend.is_some() {
        config.backend = backend;
    }
    if let Some(interval) = poll_interval_ms {
        config.poll_interval_ms = interval;
    }
    config.validate().context("invalid monitor settings")?;
    Ok(config)
}
