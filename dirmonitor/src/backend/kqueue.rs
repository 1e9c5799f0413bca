//! kqueue backend for macOS and the BSDs.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::pipe::SignalPipe;
use super::{Backend, Change, Emit, WatchId, records};
use crate::config::{MonitorConfig, WatchMode};

const MAX_EVENTS: usize = 64;

#[cfg(target_os = "macos")]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY | libc::O_CLOEXEC;
#[cfg(not(target_os = "macos"))]
const OPEN_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_CLOEXEC;

/// `udata` tag of the wakeup pipe's read filter.
const WAKEUP_TAG: usize = usize::MAX;

#[derive(Debug, Default)]
struct Watches {
    /// Handles are never reused, unlike descriptor numbers.
    next_id: i32,
    open: HashMap<WatchId, OwnedFd>,
}

/// One kqueue; each watch is an open descriptor with a vnode filter.
///
/// The watch handle travels in each filter's `udata`, so events staged for a
/// removed watch never resolve to a later watch that reuses its descriptor.
#[derive(Debug)]
pub struct KqueueBackend {
    kq: OwnedFd,
    wakeup: SignalPipe,
    watches: Mutex<Watches>,
}

impl KqueueBackend {
    /// Create the kqueue and register the wakeup pipe on it.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no arguments.
        let raw = unsafe { libc::kqueue() };
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kqueue() returned a fresh descriptor we now own.
        let kq = unsafe { OwnedFd::from_raw_fd(raw) };
        // SAFETY: F_SETFD on the descriptor just created.
        unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };

        let backend = Self {
            kq,
            wakeup: SignalPipe::new()?,
            watches: Mutex::new(Watches::default()),
        };

        let mut change = empty_kevent();
        change.ident = backend.wakeup.read_fd() as _;
        change.filter = libc::EVFILT_READ as _;
        change.flags = libc::EV_ADD as _;
        change.udata = WAKEUP_TAG as _;
        backend.register(&change)?;

        Ok(backend)
    }

    pub(crate) fn init(_config: &MonitorConfig) -> io::Result<Arc<dyn Backend>> {
        Ok(Arc::new(Self::new()?))
    }

    fn register(&self, change: &libc::kevent) -> io::Result<()> {
        // SAFETY: one change entry, no event output, null timeout.
        let result = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if result == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn empty_kevent() -> libc::kevent {
    // SAFETY: kevent is a plain C struct for which all-zero is valid.
    unsafe { std::mem::zeroed() }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn mode(&self) -> WatchMode {
        WatchMode::Multiple
    }

    fn add(&self, path: &Path) -> io::Result<WatchId> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_path is NUL-terminated and outlives the call.
        let raw = unsafe { libc::open(c_path.as_ptr(), OPEN_FLAGS) };
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: open() returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut watches = self.watches.lock();
        let id = WatchId::new(watches.next_id);
        watches.next_id = watches
            .next_id
            .checked_add(1)
            .ok_or_else(|| io::Error::other("watch handles exhausted"))?;

        let mut change = empty_kevent();
        change.ident = raw as _;
        change.filter = libc::EVFILT_VNODE as _;
        change.flags = (libc::EV_ADD | libc::EV_CLEAR) as _;
        change.fflags = (libc::NOTE_DELETE
            | libc::NOTE_WRITE
            | libc::NOTE_EXTEND
            | libc::NOTE_ATTRIB
            | libc::NOTE_RENAME) as _;
        change.udata = id.as_raw() as usize as _;
        self.register(&change)?;

        watches.open.insert(id, fd);
        debug!("kqueue watch {id} (fd {raw}) on {}", path.display());
        Ok(id)
    }

    fn remove(&self, id: WatchId) {
        // Closing the descriptor drops its vnode filter from the kqueue.
        if self.watches.lock().open.remove(&id).is_none() {
            trace!("kqueue remove of unknown watch {id}");
        }
    }

    fn get_changes(&self, buf: &mut [u8]) -> usize {
        let capacity = (buf.len() / std::mem::size_of::<i32>()).min(MAX_EVENTS);
        if capacity == 0 {
            return 0;
        }
        let mut events = [empty_kevent(); MAX_EVENTS];

        // SAFETY: `events` holds at least `capacity` entries; null timeout blocks.
        let count = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                capacity as _,
                std::ptr::null(),
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("kevent wait failed: {err}");
            }
            return 0;
        }

        let mut pos = 0;
        for event in &events[..count as usize] {
            let tag = event.udata as usize;
            if tag == WAKEUP_TAG {
                trace!("kqueue wait woken for shutdown");
                return 0;
            }
            let Ok(raw) = i32::try_from(tag) else {
                continue;
            };
            if !records::write_handle(buf, &mut pos, WatchId::new(raw)) {
                break;
            }
        }
        pos
    }

    fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()> {
        records::for_each_handle(buf, |id| emit(Change::Handle(id)))
    }

    fn deinit(&self) {
        self.wakeup.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_reports_created_file() {
        let temp_dir = TempDir::new().unwrap();
        let backend = KqueueBackend::new().unwrap();
        let id = backend.add(temp_dir.path()).unwrap();

        File::create(temp_dir.path().join("created.txt")).unwrap();

        let mut buf = vec![0u8; 256];
        let len = backend.get_changes(&mut buf);
        let mut seen = Vec::new();
        let _ = backend.translate_changes(&buf[..len], &mut |change| {
            seen.push(change.key());
            ControlFlow::Continue(())
        });
        assert!(seen.contains(&Change::Handle(id).key()));
    }

    #[test]
    fn test_handles_are_not_reused_with_descriptors() {
        let temp_dir = TempDir::new().unwrap();
        let backend = KqueueBackend::new().unwrap();

        let first = backend.add(temp_dir.path()).unwrap();
        backend.remove(first);
        backend.remove(first);
        let second = backend.add(temp_dir.path()).unwrap();
        assert_ne!(first, second);

        File::create(temp_dir.path().join("after.txt")).unwrap();
        let mut buf = vec![0u8; 256];
        let len = backend.get_changes(&mut buf);
        let mut seen = Vec::new();
        let _ = backend.translate_changes(&buf[..len], &mut |change| {
            seen.push(change.key());
            ControlFlow::Continue(())
        });
        assert!(seen.contains(&Change::Handle(second).key()));
        assert!(!seen.contains(&Change::Handle(first).key()));
    }

    #[test]
    fn test_deinit_interrupts_wait() {
        let backend = Arc::new(KqueueBackend::new().unwrap());
        let reader = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 256];
                backend.get_changes(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        backend.deinit();
        assert_eq!(reader.join().unwrap(), 0);
    }
}
