//! File events reported to hosts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::WatchId;

/// A change under a watched path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    /// The kind of event.
    pub kind: FileEventKind,

    /// The watch that reported it, when known.
    pub watch: Option<WatchId>,

    /// Changed path, or the watched root for handle-reporting backends.
    pub path: PathBuf,

    /// When the event was translated.
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    /// Create a `Changed` event.
    pub fn changed(watch: Option<WatchId>, path: impl Into<PathBuf>) -> Self {
        Self::new(FileEventKind::Changed, watch, path)
    }

    /// Create a `Rescan` event for a watched root.
    pub fn rescan(watch: WatchId, root: impl Into<PathBuf>) -> Self {
        Self::new(FileEventKind::Rescan, Some(watch), root)
    }

    fn new(kind: FileEventKind, watch: Option<WatchId>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            watch,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Kind of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    /// Something was created, deleted, renamed or modified.
    Changed,

    /// Events were dropped; the whole root must be rescanned.
    Rescan,
}

/// Events translated in one check cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Events in this batch, in translation order.
    pub events: Vec<FileEvent>,

    /// When the batch was created.
    pub created_at: DateTime<Utc>,
}

impl EventBatch {
    /// Create a new empty batch.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Add an event to the batch.
    pub fn push(&mut self, event: FileEvent) {
        self.events.push(event);
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether any event asks for a rescan.
    pub fn needs_rescan(&self) -> bool {
        self.events
            .iter()
            .any(|event| event.kind == FileEventKind::Rescan)
    }

    /// Iterate over the events.
    pub fn iter(&self) -> std::slice::Iter<'_, FileEvent> {
        self.events.iter()
    }
}

impl Default for EventBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoIterator for EventBatch {
    type Item = FileEvent;
    type IntoIter = std::vec::IntoIter<FileEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
