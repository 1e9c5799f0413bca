//! Compile-time registry of the backends available on this platform.
//!
//! Entries are ordered by preference: the first one is the platform
//! default, `dummy` is always last.

use std::io;
use std::sync::Arc;

use crate::backend::{self, Backend};
use crate::config::{MonitorConfig, WatchMode};

/// Constructor for a backend object.
pub type BackendInit = fn(&MonitorConfig) -> io::Result<Arc<dyn Backend>>;

/// Static description of one compiled-in backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendDescriptor {
    /// Name used to select the backend.
    pub name: &'static str,

    /// Whether the backend keeps one watch or many.
    pub mode: WatchMode,

    /// Opens the backend's native resources.
    pub init: BackendInit,
}

static BACKENDS: &[BackendDescriptor] = &[
    #[cfg(any(target_os = "linux", target_os = "android"))]
    BackendDescriptor {
        name: "inotify",
        mode: WatchMode::Multiple,
        init: backend::inotify::InotifyBackend::init,
    },
    #[cfg(target_os = "macos")]
    BackendDescriptor {
        name: "fsevents",
        mode: WatchMode::Single,
        init: backend::stream::init_fsevents,
    },
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))]
    BackendDescriptor {
        name: "kqueue",
        mode: WatchMode::Multiple,
        init: backend::kqueue::KqueueBackend::init,
    },
    #[cfg(windows)]
    BackendDescriptor {
        name: "win32",
        mode: WatchMode::Single,
        init: backend::win32::Win32Backend::init,
    },
    BackendDescriptor {
        name: "notify",
        mode: WatchMode::Single,
        init: backend::stream::init_notify,
    },
    BackendDescriptor {
        name: "inodewatcher",
        mode: WatchMode::Multiple,
        init: backend::inodewatcher::InodeWatcherBackend::init,
    },
    BackendDescriptor {
        name: "dummy",
        mode: WatchMode::Multiple,
        init: backend::dummy::DummyBackend::init,
    },
];

/// Look up a backend; `None` selects the platform default.
pub fn find(name: Option<&str>) -> Option<&'static BackendDescriptor> {
    match name {
        None => BACKENDS.first(),
        Some(name) => BACKENDS.iter().find(|descriptor| descriptor.name == name),
    }
}

/// Names of all compiled backends, in preference order.
pub fn names() -> Vec<&'static str> {
    BACKENDS.iter().map(|descriptor| descriptor.name).collect()
}

/// All compiled backends, in preference order.
pub fn descriptors() -> &'static [BackendDescriptor] {
    BACKENDS
}
