//! Native change-detection backends.
//!
//! Every backend implements the same small contract so the monitor and the
//! watch list can be written once:
//!
//! - `add` / `remove` register and cancel watches,
//! - `get_changes` blocks on the native wait primitive and copies raw event
//!   records into a caller-owned buffer,
//! - `translate_changes` turns those raw records into [`Change`]s,
//! - `deinit` interrupts a blocked `get_changes` so the monitor can shut down.
//!
//! Native resources are released when the backend is dropped, which the
//! monitor only does after its collection thread has exited.

use std::fmt;
use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::config::WatchMode;

pub mod dummy;
pub mod inodewatcher;
pub mod records;
pub mod stream;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod inotify;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

#[cfg(windows)]
pub mod win32;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod pipe;

/// Opaque handle identifying an active watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(i32);

impl WatchId {
    /// Wrap a raw backend handle.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw backend handle.
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Whether the handle is a valid (non-negative) value.
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One discrete change decoded from a backend's raw records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change<'a> {
    /// Something changed under the watch with this handle.
    Handle(WatchId),

    /// Something changed at this path (raw bytes as reported by the OS).
    Name(&'a [u8]),

    /// The OS dropped events; every watch should be rescanned.
    Overflow,
}

impl Change<'_> {
    /// Owned identity used to coalesce repeated changes within one check.
    pub fn key(&self) -> ChangeKey {
        match *self {
            Self::Handle(id) => ChangeKey::Handle(id),
            Self::Name(name) => ChangeKey::Name(name.to_vec()),
            Self::Overflow => ChangeKey::Overflow,
        }
    }
}

/// Owned form of a [`Change`] identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeKey {
    Handle(WatchId),
    Name(Vec<u8>),
    Overflow,
}

/// Callback invoked once per translated change.
pub type Emit<'e> = dyn FnMut(Change<'_>) -> ControlFlow<()> + 'e;

/// The contract every native backend implements.
pub trait Backend: Send + Sync {
    /// Registry name of the backend.
    fn name(&self) -> &'static str;

    /// Whether `add` replaces or accumulates watches.
    fn mode(&self) -> WatchMode;

    /// Start watching `path` for create, delete, rename and modify events.
    fn add(&self, path: &Path) -> io::Result<WatchId>;

    /// Stop watching. Unknown or stale handles are ignored.
    fn remove(&self, id: WatchId);

    /// Block until native events are available or the backend is interrupted.
    ///
    /// Returns the number of bytes written into `buf`; 0 means nothing was
    /// read (interrupted, transient error). Records are never split.
    fn get_changes(&self, buf: &mut [u8]) -> usize;

    /// Decode raw records produced by `get_changes`, calling `emit` for each.
    ///
    /// Returns `Break` as soon as `emit` does.
    fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()>;

    /// Interrupt any blocked `get_changes` and stop native watching.
    fn deinit(&self);
}

/// Latch used by backends without a native wakeup channel.
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn trigger(&self) {
        *self.triggered.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Wait until triggered.
    pub(crate) fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.cond.wait(&mut triggered);
        }
    }

    /// Wait up to `timeout`; returns whether the signal fired.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut triggered = self.triggered.lock();
        if !*triggered {
            self.cond.wait_for(&mut triggered, timeout);
        }
        *triggered
    }
}
