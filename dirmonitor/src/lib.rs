//! # Directory Monitor
//!
//! Native directory change monitoring behind one small backend contract.
//! Hosts register paths and poll for batched change notifications; the
//! most efficient facility on each platform does the work.
//!
//! ## Backends
//!
//! - **inotify** (Linux/Android): kernel watch descriptors
//! - **fsevents** (macOS) / **notify** (everywhere): callback streams
//! - **kqueue** (macOS/BSD): vnode filters on open descriptors
//! - **win32** (Windows): overlapped `ReadDirectoryChangesW`
//! - **inodewatcher**: recursive stat snapshots, works anywhere
//! - **dummy**: accepts watches, never reports
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Directory Monitor                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  registry::find ──► Backend ◄── collection thread               │
//! │                        │              │ get_changes             │
//! │                        ▼              ▼                         │
//! │  Watchlist ──► Monitor::check ◄── staged buffer (Pending)       │
//! │       │                                                         │
//! │       ▼                                                         │
//! │  EventBatch / FileEvent                                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use dirmonitor::Watchlist;
//!
//! # fn main() -> dirmonitor::Result<()> {
//! let mut list = Watchlist::open(None)?;
//! list.watch("/tmp")?;
//! while let Some(batch) = list.poll() {
//!     for event in batch {
//!         println!("{:?} {}", event.kind, event.path.display());
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod monitor;
pub mod registry;
pub mod watchlist;

pub use backend::{Backend, Change, ChangeKey, WatchId};
pub use config::{MonitorConfig, WatchMode};
pub use error::{MonitorError, Result};
pub use event::{EventBatch, FileEvent, FileEventKind};
pub use monitor::{CheckOutcome, Monitor, MonitorState, Pending};
pub use registry::BackendDescriptor;
pub use watchlist::Watchlist;
