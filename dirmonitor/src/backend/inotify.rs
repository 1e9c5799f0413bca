//! Linux inotify backend.

use std::ffi::CString;
use std::io;
use std::ops::ControlFlow;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::{debug, trace, warn};

use super::pipe::SignalPipe;
use super::{Backend, Change, Emit, WatchId};
use crate::config::{MonitorConfig, WatchMode};

const WATCH_MASK: u32 =
    libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVED_FROM | libc::IN_MODIFY | libc::IN_MOVED_TO;

/// Size of `struct inotify_event` without the trailing name.
const EVENT_HEADER_LEN: usize = 16;

/// inotify instance plus a pipe used to wake the reader on shutdown.
#[derive(Debug)]
pub struct InotifyBackend {
    fd: OwnedFd,
    wakeup: SignalPipe,
}

impl InotifyBackend {
    /// Open a new inotify instance.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall with flag arguments.
        let raw = unsafe { libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK) };
        if raw == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: inotify_init1 returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        Ok(Self {
            fd,
            wakeup: SignalPipe::new()?,
        })
    }

    pub(crate) fn init(_config: &MonitorConfig) -> io::Result<std::sync::Arc<dyn Backend>> {
        Ok(std::sync::Arc::new(Self::new()?))
    }
}

impl Backend for InotifyBackend {
    fn name(&self) -> &'static str {
        "inotify"
    }

    fn mode(&self) -> WatchMode {
        WatchMode::Multiple
    }

    fn add(&self, path: &Path) -> io::Result<WatchId> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_path is NUL-terminated and outlives the call.
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), WATCH_MASK) };
        if wd == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!("inotify watch {wd} on {}", path.display());
        Ok(WatchId::new(wd))
    }

    fn remove(&self, id: WatchId) {
        // SAFETY: removing an unknown descriptor only yields EINVAL.
        let result = unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), id.as_raw()) };
        if result == -1 {
            trace!(
                "inotify_rm_watch({id}) failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn get_changes(&self, buf: &mut [u8]) -> usize {
        let mut fds = [
            libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wakeup.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: `fds` is a valid array of two pollfd structs.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if ready == -1 {
            trace!("inotify poll interrupted: {}", io::Error::last_os_error());
            return 0;
        }
        if fds[1].revents != 0 {
            trace!("inotify wait woken for shutdown");
            return 0;
        }
        if fds[0].revents & libc::POLLIN == 0 {
            return 0;
        }

        // SAFETY: reads at most buf.len() bytes into the caller's buffer.
        let read = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock && err.kind() != io::ErrorKind::Interrupted {
                warn!("inotify read failed: {err}");
            }
            return 0;
        }
        read as usize
    }

    fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()> {
        for_each_event(buf, |wd, mask| {
            if mask & libc::IN_Q_OVERFLOW != 0 {
                emit(Change::Overflow)
            } else if mask & libc::IN_IGNORED != 0 {
                ControlFlow::Continue(())
            } else {
                emit(Change::Handle(WatchId::new(wd)))
            }
        })
    }

    fn deinit(&self) {
        self.wakeup.signal();
    }
}

/// Walk `inotify_event` records, passing each watch descriptor and mask.
fn for_each_event<F>(buf: &[u8], mut f: F) -> ControlFlow<()>
where
    F: FnMut(i32, u32) -> ControlFlow<()>,
{
    let mut pos = 0usize;
    while pos + EVENT_HEADER_LEN <= buf.len() {
        let field = |offset: usize| {
            let at = pos + offset;
            [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
        };
        let wd = i32::from_ne_bytes(field(0));
        let mask = u32::from_ne_bytes(field(4));
        let name_len = u32::from_ne_bytes(field(12)) as usize;

        let Some(next) = (pos + EVENT_HEADER_LEN).checked_add(name_len) else {
            break;
        };
        if next > buf.len() {
            break;
        }
        f(wd, mask)?;
        pos = next;
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn record(wd: i32, mask: u32, name: &[u8]) -> Vec<u8> {
        let padded = name.len().div_ceil(4) * 4;
        let mut out = Vec::new();
        out.extend_from_slice(&wd.to_ne_bytes());
        out.extend_from_slice(&mask.to_ne_bytes());
        out.extend_from_slice(&0u32.to_ne_bytes());
        out.extend_from_slice(&(padded as u32).to_ne_bytes());
        out.extend_from_slice(name);
        out.resize(out.len() + padded - name.len(), 0);
        out
    }

    fn translate(backend: &InotifyBackend, buf: &[u8]) -> Vec<String> {
        let mut seen = Vec::new();
        let _ = backend.translate_changes(buf, &mut |change| {
            seen.push(match change {
                Change::Handle(id) => format!("handle:{id}"),
                Change::Name(name) => format!("name:{}", String::from_utf8_lossy(name)),
                Change::Overflow => "overflow".to_string(),
            });
            ControlFlow::Continue(())
        });
        seen
    }

    #[test]
    fn test_translate_steps_over_names() {
        let backend = InotifyBackend::new().unwrap();
        let mut buf = record(3, libc::IN_CREATE, b"a-long-file-name.txt");
        buf.extend(record(4, libc::IN_DELETE, b""));
        buf.extend(record(-1, libc::IN_Q_OVERFLOW, b""));
        buf.extend(record(3, libc::IN_IGNORED, b""));

        assert_eq!(
            translate(&backend, &buf),
            vec!["handle:3", "handle:4", "overflow"]
        );
    }

    #[test]
    fn test_translate_drops_truncated_record() {
        let backend = InotifyBackend::new().unwrap();
        let mut buf = record(1, libc::IN_MODIFY, b"ok");
        let mut broken = record(2, libc::IN_MODIFY, b"name");
        broken[12..16].copy_from_slice(&4096u32.to_ne_bytes());
        buf.extend(broken);

        assert_eq!(translate(&backend, &buf), vec!["handle:1"]);
    }

    #[test]
    fn test_add_missing_path_fails() {
        let backend = InotifyBackend::new().unwrap();
        let err = backend
            .add(Path::new("/nonexistent/dirmonitor/path"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_reports_created_file() {
        let temp_dir = TempDir::new().unwrap();
        let backend = InotifyBackend::new().unwrap();
        let id = backend.add(temp_dir.path()).unwrap();

        File::create(temp_dir.path().join("created.txt")).unwrap();

        let mut buf = vec![0u8; 4096];
        let len = backend.get_changes(&mut buf);
        assert!(len > 0);
        let changes = translate(&backend, &buf[..len]);
        assert!(changes.contains(&format!("handle:{id}")));
    }

    #[test]
    fn test_deinit_interrupts_wait() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(InotifyBackend::new().unwrap());
        backend.add(temp_dir.path()).unwrap();

        let reader = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 4096];
                backend.get_changes(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        backend.deinit();
        assert_eq!(reader.join().unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_remove_unknown_handle_is_silent() {
        let backend = InotifyBackend::new().unwrap();
        backend.remove(WatchId::new(12345));
        backend.remove(WatchId::new(-1));
    }
}
