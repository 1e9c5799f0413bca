//! Monitor coordinator.
//!
//! A [`Monitor`] binds one backend for its whole life and runs at most one
//! collection thread. The thread blocks in [`Backend::get_changes`], stages
//! the raw bytes it read and goes back to sleep until the foreground has
//! translated them with [`Monitor::check`]. Disposal publishes
//! [`Pending::Disposed`], interrupts the backend and joins the thread.

use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Change, WatchId};
use crate::config::{MonitorConfig, WatchMode};
use crate::error::{MonitorError, Result};
use crate::registry;

/// State of the staged raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Nothing staged; the collection thread may read.
    Idle,

    /// This many bytes are staged and waiting for `check`.
    Filled(usize),

    /// The monitor is shutting down or gone.
    Disposed,
}

/// Lifecycle of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Backend open, no collection thread yet.
    Created,

    /// Collection thread running.
    Watching,

    /// Terminal.
    Disposed,
}

/// Result of one [`Monitor::check`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No more data will ever arrive.
    Disposed,

    /// A staged batch was translated (possibly into zero changes).
    Changed,

    /// Nothing staged.
    Idle,
}

struct Staging {
    pending: Pending,
    buffer: Vec<u8>,
}

struct Shared {
    backend: Arc<dyn Backend>,
    staging: Mutex<Staging>,
    cond: Condvar,
    changed: Notify,
    idle_backoff: Duration,
}

/// Watches paths through one backend and stages its events for polling.
pub struct Monitor {
    shared: Arc<Shared>,
    config: MonitorConfig,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Open the backend named in `config` (or the platform default).
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;

        let descriptor = match config.backend.as_deref() {
            Some(name) => registry::find(Some(name))
                .ok_or_else(|| MonitorError::BackendNotFound(name.to_string()))?,
            None => registry::find(None)
                .ok_or_else(|| MonitorError::BackendNotFound("default".to_string()))?,
        };

        let backend = (descriptor.init)(&config).map_err(|source| MonitorError::BackendInit {
            backend: descriptor.name,
            source,
        })?;

        info!("Using {} backend ({} mode)", descriptor.name, descriptor.mode);
        Ok(Self::from_parts(backend, config))
    }

    /// Open a backend by name with default settings.
    pub fn open(backend: Option<&str>) -> Result<Self> {
        let mut config = MonitorConfig::new();
        config.backend = backend.map(str::to_string);
        Self::new(config)
    }

    /// Wrap an already-constructed backend.
    pub fn with_backend(backend: Arc<dyn Backend>, config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(backend, config))
    }

    fn from_parts(backend: Arc<dyn Backend>, config: MonitorConfig) -> Self {
        let shared = Arc::new(Shared {
            backend,
            staging: Mutex::new(Staging {
                pending: Pending::Idle,
                buffer: vec![0; config.buffer_capacity],
            }),
            cond: Condvar::new(),
            changed: Notify::new(),
            idle_backoff: config.idle_backoff(),
        });

        Self {
            shared,
            config,
            thread: None,
        }
    }

    /// Name of the bound backend.
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    /// Whether new watches replace or accumulate.
    pub fn mode(&self) -> WatchMode {
        self.shared.backend.mode()
    }

    /// The configuration the monitor was opened with.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Current state of the staged buffer.
    pub fn pending(&self) -> Pending {
        self.shared.staging.lock().pending
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        if self.pending() == Pending::Disposed {
            MonitorState::Disposed
        } else if self.thread.is_some() {
            MonitorState::Watching
        } else {
            MonitorState::Created
        }
    }

    /// Start watching `path`.
    ///
    /// The first call starts the collection thread. A failed registration
    /// leaves the monitor usable for other paths.
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<WatchId> {
        let path = path.as_ref();
        if self.pending() == Pending::Disposed {
            return Err(MonitorError::Disposed);
        }

        self.ensure_thread()?;

        match self.shared.backend.add(path) {
            Ok(id) => {
                debug!("Watching {} as {id}", path.display());
                Ok(id)
            }
            Err(source) => {
                warn!("Failed to watch {}: {source}", path.display());
                Err(MonitorError::WatchFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// Stop watching. Unknown or already removed handles are ignored.
    pub fn unwatch(&self, id: WatchId) {
        if self.pending() == Pending::Disposed {
            return;
        }
        debug!("Unwatching {id}");
        self.shared.backend.remove(id);
    }

    /// Translate the staged batch, if any, without blocking.
    ///
    /// Each distinct change is passed to `on_change` at most once per call.
    /// If `on_change` breaks, the batch stays staged and is translated again
    /// by the next call. `on_idle` runs when nothing is staged. Neither
    /// callback may call back into this monitor.
    pub fn check<F, I>(&self, mut on_change: F, on_idle: I) -> CheckOutcome
    where
        F: FnMut(Change<'_>) -> ControlFlow<()>,
        I: FnOnce(),
    {
        let mut staging = self.shared.staging.lock();
        let len = match staging.pending {
            Pending::Disposed => return CheckOutcome::Disposed,
            Pending::Idle => {
                drop(staging);
                on_idle();
                return CheckOutcome::Idle;
            }
            Pending::Filled(len) => len,
        };

        let mut seen = HashSet::new();
        let flow = self
            .shared
            .backend
            .translate_changes(&staging.buffer[..len], &mut |change| {
                if seen.insert(change.key()) {
                    on_change(change)
                } else {
                    ControlFlow::Continue(())
                }
            });

        if flow.is_continue() {
            staging.pending = Pending::Idle;
            self.shared.cond.notify_all();
        } else {
            trace!("Check stopped early; keeping {len} staged bytes");
        }
        CheckOutcome::Changed
    }

    /// Wait until a batch is staged or the monitor is disposed.
    pub async fn changed(&self) {
        if self.pending() == Pending::Disposed {
            return;
        }
        self.shared.changed.notified().await;
    }

    /// Stop the collection thread and release the backend.
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn dispose(&mut self) {
        {
            let mut staging = self.shared.staging.lock();
            if staging.pending == Pending::Disposed && self.thread.is_none() {
                return;
            }
            if staging.pending != Pending::Disposed {
                staging.pending = Pending::Disposed;
                self.shared.backend.deinit();
            }
        }
        self.shared.cond.notify_all();
        self.shared.changed.notify_one();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Collection thread panicked");
            }
        }
        info!("Disposed {} monitor", self.backend_name());
    }

    fn ensure_thread(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let shared = self.shared.clone();
        let capacity = self.config.buffer_capacity;
        let handle = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || collect(shared, capacity))
            .map_err(MonitorError::ThreadSpawn)?;

        debug!("Started collection thread for {}", self.backend_name());
        self.thread = Some(handle);
        Ok(())
    }

    #[cfg(test)]
    fn thread_id(&self) -> Option<thread::ThreadId> {
        self.thread.as_ref().map(|handle| handle.thread().id())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("backend", &self.backend_name())
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Body of the collection thread.
fn collect(shared: Arc<Shared>, capacity: usize) {
    let mut scratch = vec![0u8; capacity];
    loop {
        {
            let mut staging = shared.staging.lock();
            loop {
                match staging.pending {
                    Pending::Disposed => return,
                    Pending::Filled(_) => shared.cond.wait(&mut staging),
                    Pending::Idle => break,
                }
            }
        }

        let len = shared.backend.get_changes(&mut scratch);

        let mut staging = shared.staging.lock();
        match staging.pending {
            Pending::Disposed => return,
            Pending::Idle if len > 0 => {
                std::mem::swap(&mut staging.buffer, &mut scratch);
                staging.pending = Pending::Filled(len);
                drop(staging);
                trace!("Staged {len} bytes");
                shared.changed.notify_one();
            }
            _ => {
                if !shared.idle_backoff.is_zero() {
                    shared.cond.wait_for(&mut staging, shared.idle_backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Emit, ShutdownSignal, records};
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::io;
    use std::time::Instant;

    /// Backend that replays scripted handle batches.
    #[derive(Default)]
    struct ScriptedBackend {
        batches: Mutex<VecDeque<Vec<WatchId>>>,
        removed: Mutex<Vec<WatchId>>,
        next_id: Mutex<i32>,
        shutdown: ShutdownSignal,
    }

    impl ScriptedBackend {
        fn push(&self, batch: &[i32]) {
            self.batches
                .lock()
                .push_back(batch.iter().copied().map(WatchId::new).collect());
        }
    }

    impl Backend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn mode(&self) -> WatchMode {
            WatchMode::Multiple
        }

        fn add(&self, path: &Path) -> io::Result<WatchId> {
            if path == Path::new("/fail") {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            Ok(WatchId::new(*next_id))
        }

        fn remove(&self, id: WatchId) {
            self.removed.lock().push(id);
        }

        fn get_changes(&self, buf: &mut [u8]) -> usize {
            if self.shutdown.wait_timeout(Duration::from_millis(5)) {
                return 0;
            }
            let Some(batch) = self.batches.lock().pop_front() else {
                return 0;
            };
            let mut pos = 0;
            for id in batch {
                records::write_handle(buf, &mut pos, id);
            }
            pos
        }

        fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()> {
            records::for_each_handle(buf, |id| emit(Change::Handle(id)))
        }

        fn deinit(&self) {
            self.shutdown.trigger();
        }
    }

    fn scripted() -> (Arc<ScriptedBackend>, Monitor) {
        let backend = Arc::new(ScriptedBackend::default());
        let monitor = Monitor::with_backend(backend.clone(), MonitorConfig::new()).unwrap();
        (backend, monitor)
    }

    fn wait_for_batch(monitor: &Monitor) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !matches!(monitor.pending(), Pending::Filled(_)) {
            assert!(Instant::now() < deadline, "no batch was staged");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn collect_handles(monitor: &Monitor) -> (CheckOutcome, Vec<WatchId>) {
        let mut handles = Vec::new();
        let outcome = monitor.check(
            |change| {
                if let Change::Handle(id) = change {
                    handles.push(id);
                }
                ControlFlow::Continue(())
            },
            || {},
        );
        handles.sort();
        (outcome, handles)
    }

    #[test]
    fn test_duplicate_handles_emit_once_per_check() {
        let (backend, mut monitor) = scripted();
        monitor.watch("/a").unwrap();
        backend.push(&[5, 5, 7]);
        wait_for_batch(&monitor);

        let (outcome, handles) = collect_handles(&monitor);
        assert_eq!(outcome, CheckOutcome::Changed);
        assert_eq!(handles, vec![WatchId::new(5), WatchId::new(7)]);
        assert_eq!(monitor.pending(), Pending::Idle);
    }

    #[test]
    fn test_early_stop_keeps_batch() {
        let (backend, mut monitor) = scripted();
        monitor.watch("/a").unwrap();
        backend.push(&[1, 2]);
        wait_for_batch(&monitor);

        let mut calls = 0;
        let outcome = monitor.check(
            |_| {
                calls += 1;
                ControlFlow::Break(())
            },
            || {},
        );
        assert_eq!(outcome, CheckOutcome::Changed);
        assert_eq!(calls, 1);
        assert!(matches!(monitor.pending(), Pending::Filled(_)));

        let (_, handles) = collect_handles(&monitor);
        assert_eq!(handles, vec![WatchId::new(1), WatchId::new(2)]);
        assert_eq!(monitor.pending(), Pending::Idle);
    }

    #[test]
    fn test_batches_are_not_overwritten_before_check() {
        let (backend, mut monitor) = scripted();
        monitor.watch("/a").unwrap();
        backend.push(&[3]);
        backend.push(&[4]);
        wait_for_batch(&monitor);
        thread::sleep(Duration::from_millis(30));

        let (_, first) = collect_handles(&monitor);
        assert_eq!(first, vec![WatchId::new(3)]);

        wait_for_batch(&monitor);
        let (_, second) = collect_handles(&monitor);
        assert_eq!(second, vec![WatchId::new(4)]);
    }

    #[test]
    fn test_single_collection_thread() {
        let (_backend, mut monitor) = scripted();
        assert_eq!(monitor.state(), MonitorState::Created);
        assert_eq!(monitor.thread_id(), None);

        monitor.watch("/a").unwrap();
        let first = monitor.thread_id();
        assert!(first.is_some());

        monitor.watch("/b").unwrap();
        let _ = monitor.watch("/fail");
        monitor.watch("/c").unwrap();
        assert_eq!(monitor.thread_id(), first);
        assert_eq!(monitor.state(), MonitorState::Watching);
    }

    #[test]
    fn test_unwatch_is_idempotent() {
        let (backend, mut monitor) = scripted();
        let a = monitor.watch("/a").unwrap();
        let b = monitor.watch("/b").unwrap();
        assert_ne!(a, b);

        monitor.unwatch(a);
        monitor.unwatch(a);
        monitor.unwatch(WatchId::new(-1));
        assert_eq!(backend.removed.lock().len(), 3);

        backend.push(&[b.as_raw()]);
        wait_for_batch(&monitor);
        let (_, handles) = collect_handles(&monitor);
        assert_eq!(handles, vec![b]);
    }

    #[test]
    fn test_failed_watch_leaves_monitor_usable() {
        let (_backend, mut monitor) = scripted();
        let err = monitor.watch("/fail").unwrap_err();
        assert!(err.is_watch_local());
        assert!(monitor.watch("/ok").is_ok());
    }

    #[test]
    fn test_dispose_terminates_blocked_thread() {
        let mut monitor = Monitor::open(Some("dummy")).unwrap();
        monitor.watch("/tmp/x").unwrap();

        let started = Instant::now();
        monitor.dispose();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(monitor.state(), MonitorState::Disposed);

        monitor.dispose();
        assert_eq!(monitor.pending(), Pending::Disposed);
    }

    #[test]
    fn test_dummy_scenario() {
        let mut monitor = Monitor::open(Some("dummy")).unwrap();
        let id = monitor.watch("/tmp/x").unwrap();
        assert!(id.is_valid());

        let mut idle = false;
        let outcome = monitor.check(|_| ControlFlow::Continue(()), || idle = true);
        assert_eq!(outcome, CheckOutcome::Idle);
        assert!(idle);

        monitor.dispose();
        let outcome = monitor.check(|_| ControlFlow::Continue(()), || {});
        assert_eq!(outcome, CheckOutcome::Disposed);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let err = Monitor::open(Some("nonexistent")).unwrap_err();
        assert!(matches!(err, MonitorError::BackendNotFound(ref name) if name == "nonexistent"));
    }

    #[test]
    fn test_dispose_without_watch() {
        let mut monitor = Monitor::open(Some("dummy")).unwrap();
        monitor.dispose();
        assert_eq!(monitor.state(), MonitorState::Disposed);
        assert!(matches!(
            monitor.watch("/tmp/x"),
            Err(MonitorError::Disposed)
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MonitorConfig::new().with_buffer_capacity(1);
        assert!(matches!(
            Monitor::new(config),
            Err(MonitorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_changed_wakes_on_staged_batch() {
        let (backend, mut monitor) = scripted();
        monitor.watch("/a").unwrap();
        backend.push(&[9]);

        tokio::time::timeout(Duration::from_secs(10), monitor.changed())
            .await
            .unwrap();
        assert!(matches!(monitor.pending(), Pending::Filled(_)));
    }

    #[tokio::test]
    async fn test_changed_returns_after_dispose() {
        let mut monitor = Monitor::open(Some("dummy")).unwrap();
        monitor.dispose();
        tokio::time::timeout(Duration::from_secs(1), monitor.changed())
            .await
            .unwrap();
    }
}
