//! Error types for the directory monitor.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur in the directory monitor.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// No compiled-in backend matches the requested name.
    #[error("unable to find dirmonitor backend '{0}'")]
    BackendNotFound(String),

    /// The backend could not open its native resources.
    #[error("failed to initialize backend {backend}: {source}")]
    BackendInit {
        backend: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The backend rejected a watch registration.
    #[error("failed to watch {}: {source}", path.display())]
    WatchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The collection thread could not be started.
    #[error("failed to spawn collection thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The monitor has already been disposed.
    #[error("monitor has been disposed")]
    Disposed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Whether this error only affects a single watch and leaves the monitor usable.
    pub fn is_watch_local(&self) -> bool {
        matches!(self, Self::WatchFailed { .. })
    }
}
