//! Callback-driven stream backends built on the `notify` crate.
//!
//! The OS delivers events on its own thread (FSEvents run loop, notify's
//! inotify/kqueue/Windows event loop). The callback queues the reported
//! paths and wakes the collection thread, which drains them into
//! length-prefixed name records. Paths that do not fit in one buffer stay
//! queued for the next read.

use std::collections::VecDeque;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use notify::{RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{Backend, Change, Emit, WatchId, records};
use crate::config::{MonitorConfig, WatchMode};

/// Paths held before the queue gives up and reports an overflow.
const MAX_QUEUED_PATHS: usize = 16 * 1024;

#[derive(Debug, Default)]
struct QueueState {
    /// Reported paths tagged with the stream that reported them.
    paths: VecDeque<(WatchId, Vec<u8>)>,
    active: Option<WatchId>,
    overflowed: bool,
    closed: bool,
}

/// Paths reported by the OS callback, waiting for the collection thread.
///
/// Only paths from the active stream are handed out. When more than the
/// limit pile up, they are discarded and a single empty name record is
/// emitted instead, which translates to [`Change::Overflow`].
#[derive(Debug)]
pub(crate) struct StreamQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    limit: usize,
}

impl StreamQueue {
    pub(crate) fn new() -> Self {
        Self::with_limit(MAX_QUEUED_PATHS)
    }

    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            limit: limit.max(1),
        }
    }

    pub(crate) fn push<I>(&self, stream: WatchId, paths: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let mut pushed = false;
        for path in paths {
            if state.paths.len() >= self.limit {
                if !state.overflowed {
                    warn!("stream queue exceeded {} paths; reporting overflow", self.limit);
                }
                state.paths.clear();
                state.overflowed = true;
            }
            state.paths.push_back((stream, path));
            pushed = true;
        }
        if pushed {
            self.cond.notify_one();
        }
    }

    /// Make `stream` the only one whose paths are delivered.
    pub(crate) fn activate(&self, stream: WatchId) {
        let mut state = self.state.lock();
        state.active = Some(stream);
        state.paths.retain(|(id, _)| *id == stream);
    }

    /// Drop the active stream and everything it queued.
    pub(crate) fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = None;
        state.paths.clear();
        state.overflowed = false;
    }

    /// Wake the reader for good.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.paths.clear();
        self.cond.notify_all();
    }

    /// Block until something is queued, then move as many whole records as fit.
    pub(crate) fn drain_into(&self, buf: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        while !state.closed && !state.overflowed && state.paths.is_empty() {
            self.cond.wait(&mut state);
        }
        if state.closed {
            return 0;
        }

        let mut pos = 0;
        if state.overflowed && records::write_name(buf, &mut pos, b"") {
            state.overflowed = false;
        }

        let active = state.active;
        while let Some((stream, front)) = state.paths.front() {
            if Some(*stream) != active {
                trace!("discarding path from inactive stream {stream}");
                state.paths.pop_front();
            } else if records::write_name(buf, &mut pos, front) {
                state.paths.pop_front();
            } else if pos == 0 {
                warn!(
                    "dropping {} byte path that does not fit in the event buffer",
                    front.len()
                );
                state.paths.pop_front();
            } else {
                break;
            }
        }
        pos
    }
}

struct ActiveStream<W> {
    id: WatchId,
    _watcher: W,
}

/// Single-stream backend over any `notify` watcher implementation.
pub struct StreamBackend<W> {
    name: &'static str,
    queue: Arc<StreamQueue>,
    active: Mutex<Option<ActiveStream<W>>>,
    next_id: AtomicI32,
    notify_config: notify::Config,
}

impl<W> StreamBackend<W>
where
    W: Watcher + Send + 'static,
{
    /// Create a backend that will start `W` watchers on demand.
    pub fn new(name: &'static str, config: &MonitorConfig) -> Self {
        Self {
            name,
            queue: Arc::new(StreamQueue::new()),
            active: Mutex::new(None),
            next_id: AtomicI32::new(1),
            notify_config: notify::Config::default().with_poll_interval(config.poll_interval()),
        }
    }

    fn next_id(&self) -> io::Result<WatchId> {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        if raw < 0 {
            return Err(io::Error::other("watch handles exhausted"));
        }
        Ok(WatchId::new(raw))
    }
}

impl<W> Backend for StreamBackend<W>
where
    W: Watcher + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn mode(&self) -> WatchMode {
        WatchMode::Single
    }

    fn add(&self, path: &Path) -> io::Result<WatchId> {
        let id = self.next_id()?;
        let queue = self.queue.clone();
        let name = self.name;
        let mut watcher = W::new(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    trace!("{name} stream {id} event {:?}", event.kind);
                    queue.push(id, event.paths.iter().map(PathBuf::as_path).map(path_bytes));
                }
                Err(e) => warn!("{name} stream error: {e}"),
            },
            self.notify_config,
        )
        .map_err(into_io)?;
        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(into_io)?;

        // The previous stream stays active until the new one is running.
        let previous = self.active.lock().replace(ActiveStream {
            id,
            _watcher: watcher,
        });
        self.queue.activate(id);
        if let Some(previous) = previous {
            debug!("{} stream {} replaced", self.name, previous.id);
        }
        debug!("{} stream {id} started on {}", self.name, path.display());
        Ok(id)
    }

    fn remove(&self, id: WatchId) {
        let mut active = self.active.lock();
        if active.as_ref().map(|stream| stream.id) != Some(id) {
            trace!("{} remove of inactive stream {id}", self.name);
            return;
        }
        active.take();
        self.queue.deactivate();
        debug!("{} stream {id} stopped", self.name);
    }

    fn get_changes(&self, buf: &mut [u8]) -> usize {
        self.queue.drain_into(buf)
    }

    fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()> {
        records::for_each_name(buf, |name| {
            if name.is_empty() {
                emit(Change::Overflow)
            } else {
                emit(Change::Name(name))
            }
        })
    }

    fn deinit(&self) {
        self.queue.close();
        self.active.lock().take();
    }
}

/// Portable stream backend using notify's recommended watcher.
pub(crate) fn init_notify(config: &MonitorConfig) -> io::Result<Arc<dyn Backend>> {
    Ok(Arc::new(StreamBackend::<notify::RecommendedWatcher>::new(
        "notify", config,
    )))
}

/// macOS FSEvents stream backend.
#[cfg(target_os = "macos")]
pub(crate) fn init_fsevents(config: &MonitorConfig) -> io::Result<Arc<dyn Backend>> {
    Ok(Arc::new(StreamBackend::<notify::FsEventWatcher>::new(
        "fsevents", config,
    )))
}

fn into_io(err: notify::Error) -> io::Error {
    match err.kind {
        notify::ErrorKind::Io(source) => source,
        notify::ErrorKind::PathNotFound => {
            io::Error::new(io::ErrorKind::NotFound, "path not found")
        }
        kind => io::Error::other(notify::Error::new(kind)),
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}
