//! Generic recursive walker backend.
//!
//! Works anywhere the standard library can stat files. Each watch keeps a
//! snapshot of `(inode, size, mtime)` for every entry below its root; the
//! collection thread rescans all roots every poll interval and reports the
//! handles whose snapshot changed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, trace};
use walkdir::WalkDir;

use super::{Backend, Change, Emit, ShutdownSignal, WatchId, records};
use crate::config::{MonitorConfig, WatchMode};

/// What the walker remembers about one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    inode: u64,
    len: u64,
    modified: Option<SystemTime>,
}

impl Stamp {
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            inode: inode(metadata),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

type Snapshot = HashMap<PathBuf, Stamp>;

/// Walk `root` recursively and stamp every entry, the root included.
fn snapshot(root: &Path) -> Snapshot {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            Some((entry.into_path(), Stamp::from_metadata(&metadata)))
        })
        .collect()
}

#[derive(Debug)]
struct Root {
    path: PathBuf,
    snapshot: Snapshot,
}

#[derive(Debug, Default)]
struct Table {
    next_id: i32,
    roots: BTreeMap<WatchId, Root>,
    /// Handles found changed that did not fit in the last buffer.
    carry: VecDeque<WatchId>,
}

/// Polling backend comparing recursive directory snapshots.
#[derive(Debug)]
pub struct InodeWatcherBackend {
    table: Mutex<Table>,
    interval: Duration,
    shutdown: ShutdownSignal,
}

impl InodeWatcherBackend {
    /// Create a walker that rescans every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            interval,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub(crate) fn init(config: &MonitorConfig) -> io::Result<Arc<dyn Backend>> {
        Ok(Arc::new(Self::new(config.poll_interval())))
    }

    /// Rescan every root and queue the handles whose snapshot changed.
    fn scan(&self) {
        let mut table = self.table.lock();
        let Table { roots, carry, .. } = &mut *table;
        for (id, root) in roots.iter_mut() {
            let current = snapshot(&root.path);
            if current != root.snapshot {
                trace!("inodewatcher change under {}", root.path.display());
                root.snapshot = current;
                if !carry.contains(id) {
                    carry.push_back(*id);
                }
            }
        }
    }

    fn drain_into(&self, buf: &mut [u8]) -> usize {
        let mut table = self.table.lock();
        let mut pos = 0;
        while let Some(id) = table.carry.front().copied() {
            if !records::write_handle(buf, &mut pos, id) {
                break;
            }
            table.carry.pop_front();
        }
        pos
    }
}

impl Backend for InodeWatcherBackend {
    fn name(&self) -> &'static str {
        "inodewatcher"
    }

    fn mode(&self) -> WatchMode {
        WatchMode::Multiple
    }

    fn add(&self, path: &Path) -> io::Result<WatchId> {
        // Surface missing paths and permission errors up front.
        std::fs::metadata(path)?;
        let snapshot = snapshot(path);

        let mut table = self.table.lock();
        let id = WatchId::new(table.next_id);
        table.next_id = table
            .next_id
            .checked_add(1)
            .ok_or_else(|| io::Error::other("watch handles exhausted"))?;
        debug!(
            "inodewatcher watch {id} on {} ({} entries)",
            path.display(),
            snapshot.len()
        );
        table.roots.insert(
            id,
            Root {
                path: path.to_path_buf(),
                snapshot,
            },
        );
        Ok(id)
    }

    fn remove(&self, id: WatchId) {
        let mut table = self.table.lock();
        table.roots.remove(&id);
        table.carry.retain(|queued| *queued != id);
    }

    fn get_changes(&self, buf: &mut [u8]) -> usize {
        loop {
            if self.shutdown.is_triggered() {
                return 0;
            }
            let pending = self.drain_into(buf);
            if pending > 0 {
                return pending;
            }
            if self.shutdown.wait_timeout(self.interval) {
                return 0;
            }
            self.scan();
        }
    }

    fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()> {
        records::for_each_handle(buf, |id| emit(Change::Handle(id)))
    }

    fn deinit(&self) {
        self.shutdown.trigger();
    }
}
