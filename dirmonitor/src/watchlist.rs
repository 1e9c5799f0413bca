//! Host-facing watch list over a [`Monitor`].
//!
//! Maps backend handles back to the paths the host registered, resolves
//! path-reporting backends' names to absolute paths and turns overflow into
//! rescan requests, producing one [`EventBatch`] per poll.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::backend::{Change, WatchId};
use crate::config::{MonitorConfig, WatchMode};
use crate::error::Result;
use crate::event::{EventBatch, FileEvent};
use crate::monitor::{CheckOutcome, Monitor};

/// Watched roots plus the monitor reporting on them.
#[derive(Debug)]
pub struct Watchlist {
    monitor: Monitor,
    roots: BTreeMap<WatchId, PathBuf>,
}

impl Watchlist {
    /// Open a monitor from `config` and wrap it.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Ok(Self::from_monitor(Monitor::new(config)?))
    }

    /// Open a backend by name with default settings.
    pub fn open(backend: Option<&str>) -> Result<Self> {
        Ok(Self::from_monitor(Monitor::open(backend)?))
    }

    /// Wrap an existing monitor that has no watches yet.
    pub fn from_monitor(monitor: Monitor) -> Self {
        Self {
            monitor,
            roots: BTreeMap::new(),
        }
    }

    /// The underlying monitor.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Whether new watches replace or accumulate.
    pub fn mode(&self) -> WatchMode {
        self.monitor.mode()
    }

    /// Name of the bound backend.
    pub fn backend_name(&self) -> &'static str {
        self.monitor.backend_name()
    }

    /// Paths currently watched.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.roots.values().map(PathBuf::as_path)
    }

    /// Start watching `path`; on single-mode backends this replaces the
    /// previous watch.
    pub fn watch(&mut self, path: impl AsRef<Path>) -> Result<WatchId> {
        let path = path.as_ref();
        let id = self.monitor.watch(path)?;

        if self.mode() == WatchMode::Single {
            self.roots.clear();
        }
        self.roots.insert(id, path.to_path_buf());
        Ok(id)
    }

    /// Stop watching `path`. Returns whether it was watched.
    pub fn unwatch(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let Some(id) = self
            .roots
            .iter()
            .find_map(|(id, root)| (root == path).then_some(*id))
        else {
            trace!("Unwatch of unknown path {}", path.display());
            return false;
        };

        self.monitor.unwatch(id);
        self.roots.remove(&id);
        debug!("Removed watch on {}", path.display());
        true
    }

    /// Collect whatever the monitor has staged.
    ///
    /// Returns `None` once the monitor is disposed; an empty batch means
    /// nothing changed since the last poll.
    pub fn poll(&self) -> Option<EventBatch> {
        let mut batch = EventBatch::new();
        let outcome = self.monitor.check(
            |change| {
                self.translate(change, &mut batch);
                ControlFlow::Continue(())
            },
            || {},
        );

        match outcome {
            CheckOutcome::Disposed => None,
            CheckOutcome::Changed | CheckOutcome::Idle => Some(batch),
        }
    }

    /// Wait until the monitor has something staged or is disposed.
    pub async fn changed(&self) {
        self.monitor.changed().await;
    }

    /// Dispose the monitor and forget every watch.
    pub fn dispose(&mut self) {
        self.monitor.dispose();
        self.roots.clear();
    }

    fn translate(&self, change: Change<'_>, batch: &mut EventBatch) {
        match change {
            Change::Handle(id) => match self.roots.get(&id) {
                Some(root) => batch.push(FileEvent::changed(Some(id), root.clone())),
                None => trace!("Dropping change for stale watch {id}"),
            },
            Change::Name(name) => {
                let (watch, path) = self.resolve(name_to_path(name));
                batch.push(FileEvent::changed(watch, path));
            }
            Change::Overflow => {
                for (id, root) in &self.roots {
                    batch.push(FileEvent::rescan(*id, root.clone()));
                }
            }
        }
    }

    /// Find the watch a reported name belongs to and make it absolute.
    fn resolve(&self, name: PathBuf) -> (Option<WatchId>, PathBuf) {
        if name.is_absolute() {
            let owner = self
                .roots
                .iter()
                .filter(|(_, root)| name.starts_with(root))
                .max_by_key(|(_, root)| root.components().count())
                .map(|(id, _)| *id);
            // Stream backends may report canonical paths that differ from
            // the registered spelling; single mode has only one candidate.
            let owner = owner.or_else(|| self.sole_root().map(|(id, _)| id));
            return (owner, name);
        }

        match self.sole_root().or_else(|| {
            self.roots
                .iter()
                .next()
                .map(|(id, root)| (*id, root.as_path()))
        }) {
            Some((id, root)) => (Some(id), root.join(name)),
            None => (None, name),
        }
    }

    fn sole_root(&self) -> Option<(WatchId, &Path)> {
        if self.roots.len() != 1 {
            return None;
        }
        self.roots
            .iter()
            .next()
            .map(|(id, root)| (*id, root.as_path()))
    }
}

#[cfg(unix)]
fn name_to_path(name: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(name))
}

#[cfg(not(unix))]
fn name_to_path(name: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(name).into_owned())
}
