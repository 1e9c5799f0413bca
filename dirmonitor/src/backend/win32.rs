//! Windows backend using overlapped `ReadDirectoryChangesW`.
//!
//! Only one directory is watched at a time. The directory handle and its
//! `OVERLAPPED` are owned by the collection side; `add`/`remove` hand over
//! a new handle (or a request to drop the current one) through a command
//! slot and set the wake event, so an in-flight read is always cancelled and
//! completed before its handle is closed.

use std::io;
use std::iter;
use std::ops::ControlFlow;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use windows_sys::Win32::Foundation::{
    ERROR_NOTIFY_ENUM_DIR, FALSE, HANDLE, INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING, ReadDirectoryChangesW,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    CreateEventW, INFINITE, SetEvent, WaitForMultipleObjects,
};

use super::{Backend, Change, Emit, WatchId, records};
use crate::config::{MonitorConfig, WatchMode};

const NOTIFY_FILTER: u32 =
    FILE_NOTIFY_CHANGE_FILE_NAME | FILE_NOTIFY_CHANGE_DIR_NAME | FILE_NOTIFY_CHANGE_LAST_WRITE;

enum Command {
    Watch(OwnedHandle),
    Unwatch,
}

struct Reader {
    dir: Option<OwnedHandle>,
    io_event: OwnedHandle,
    overlapped: Box<OVERLAPPED>,
    buffer: Vec<u32>,
    in_flight: bool,
}

// SAFETY: the OVERLAPPED and buffer are only touched while the reader mutex
// is held, and the kernel only writes them while a read is in flight, which
// `cancel` always completes before the reader is reused or dropped.
unsafe impl Send for Reader {}

impl Reader {
    fn dir_handle(&self) -> Option<HANDLE> {
        self.dir.as_ref().map(|dir| dir.as_raw_handle() as HANDLE)
    }

    /// Start a read on the current directory if none is pending.
    fn issue(&mut self) -> io::Result<()> {
        let Some(dir) = self.dir_handle() else {
            return Ok(());
        };
        if self.in_flight {
            return Ok(());
        }

        // SAFETY: OVERLAPPED is plain data; all-zero is its documented initial state.
        *self.overlapped = unsafe { std::mem::zeroed() };
        self.overlapped.hEvent = self.io_event.as_raw_handle() as HANDLE;
        let byte_len = u32::try_from(self.buffer.len() * 4).unwrap_or(u32::MAX);

        // SAFETY: buffer and overlapped are heap allocations owned by the
        // reader that stay alive until the read completes or is cancelled.
        let ok = unsafe {
            ReadDirectoryChangesW(
                dir,
                self.buffer.as_mut_ptr().cast(),
                byte_len,
                TRUE,
                NOTIFY_FILTER,
                std::ptr::null_mut(),
                &mut *self.overlapped,
                None,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        self.in_flight = true;
        Ok(())
    }

    /// Collect a finished read; `Ok(None)` means the OS dropped events.
    fn complete(&mut self) -> io::Result<Option<usize>> {
        let Some(dir) = self.dir_handle() else {
            return Ok(Some(0));
        };
        let mut transferred = 0u32;
        // SAFETY: the read on `dir` using this OVERLAPPED has signalled completion.
        let ok = unsafe { GetOverlappedResult(dir, &*self.overlapped, &mut transferred, FALSE) };
        self.in_flight = false;
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(ERROR_NOTIFY_ENUM_DIR as i32) {
                return Ok(None);
            }
            return Err(err);
        }
        if transferred == 0 {
            return Ok(None);
        }
        Ok(Some(transferred as usize))
    }

    /// Cancel and wait out any pending read.
    fn cancel(&mut self) {
        if !self.in_flight {
            return;
        }
        if let Some(dir) = self.dir_handle() {
            let mut transferred = 0u32;
            // SAFETY: cancels the read issued with this OVERLAPPED, then
            // blocks until the kernel has released the buffer.
            unsafe {
                CancelIoEx(dir, &*self.overlapped);
                GetOverlappedResult(dir, &*self.overlapped, &mut transferred, TRUE);
            }
        }
        self.in_flight = false;
    }

    fn copy_into(&self, buf: &mut [u8], len: usize) -> usize {
        let len = len.min(buf.len()).min(self.buffer.len() * 4);
        for (chunk, word) in buf[..len].chunks_mut(4).zip(&self.buffer) {
            let bytes = word.to_ne_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        len
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Watches one directory tree with overlapped I/O.
pub struct Win32Backend {
    reader: Mutex<Reader>,
    command: Mutex<Option<Command>>,
    wake: OwnedHandle,
    shutdown: AtomicBool,
    /// Handle of the directory the last command selected.
    current: Mutex<Option<WatchId>>,
    next_id: AtomicI32,
}

impl Win32Backend {
    /// Create the wake and I/O events.
    pub fn new(config: &MonitorConfig) -> io::Result<Self> {
        let wake = create_event()?;
        let io_event = create_event()?;
        Ok(Self {
            reader: Mutex::new(Reader {
                dir: None,
                io_event,
                // SAFETY: OVERLAPPED is plain data; all-zero is valid.
                overlapped: Box::new(unsafe { std::mem::zeroed() }),
                buffer: vec![0u32; config.buffer_capacity / 4],
                in_flight: false,
            }),
            command: Mutex::new(None),
            wake,
            shutdown: AtomicBool::new(false),
            current: Mutex::new(None),
            next_id: AtomicI32::new(1),
        })
    }

    pub(crate) fn init(config: &MonitorConfig) -> io::Result<Arc<dyn Backend>> {
        Ok(Arc::new(Self::new(config)?))
    }

    fn post(&self, command: Command) {
        // A command that was never picked up is replaced; its handle closes here.
        *self.command.lock() = Some(command);
        self.signal_wake();
    }

    fn signal_wake(&self) {
        // SAFETY: the event handle is owned by self and open.
        if unsafe { SetEvent(self.wake.as_raw_handle() as HANDLE) } == 0 {
            trace!("SetEvent failed: {}", io::Error::last_os_error());
        }
    }
}

fn create_event() -> io::Result<OwnedHandle> {
    // SAFETY: auto-reset, initially unsignalled, unnamed event.
    let raw = unsafe { CreateEventW(std::ptr::null(), FALSE, FALSE, std::ptr::null()) };
    if raw.is_null() {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: CreateEventW returned a fresh handle we now own.
    Ok(unsafe { OwnedHandle::from_raw_handle(raw as _) })
}

impl Backend for Win32Backend {
    fn name(&self) -> &'static str {
        "win32"
    }

    fn mode(&self) -> WatchMode {
        WatchMode::Single
    }

    fn add(&self, path: &Path) -> io::Result<WatchId> {
        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect();
        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let raw = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                std::ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                std::ptr::null_mut(),
            )
        };
        if raw == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: CreateFileW returned a fresh handle we now own.
        let dir = unsafe { OwnedHandle::from_raw_handle(raw as _) };

        let raw_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if raw_id < 0 {
            return Err(io::Error::other("watch handles exhausted"));
        }
        let id = WatchId::new(raw_id);

        let mut current = self.current.lock();
        *current = Some(id);
        self.post(Command::Watch(dir));
        debug!("win32 watch {id} on {}", path.display());
        Ok(id)
    }

    fn remove(&self, id: WatchId) {
        let mut current = self.current.lock();
        if *current != Some(id) {
            trace!("win32 remove of inactive watch {id}");
            return;
        }
        *current = None;
        self.post(Command::Unwatch);
    }

    fn get_changes(&self, buf: &mut [u8]) -> usize {
        let mut reader = self.reader.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                reader.cancel();
                return 0;
            }

            if let Some(command) = self.command.lock().take() {
                reader.cancel();
                reader.dir = match command {
                    Command::Watch(dir) => Some(dir),
                    Command::Unwatch => None,
                };
            }

            if let Err(e) = reader.issue() {
                warn!("ReadDirectoryChangesW failed: {e}");
                reader.dir = None;
            }

            let wake = self.wake.as_raw_handle() as HANDLE;
            let io_event = reader.io_event.as_raw_handle() as HANDLE;
            let handles = [wake, io_event];
            let count = if reader.in_flight { 2 } else { 1 };

            // SAFETY: `handles` holds `count` open event handles.
            let result = unsafe { WaitForMultipleObjects(count, handles.as_ptr(), FALSE, INFINITE) };
            if result == WAIT_OBJECT_0 {
                continue;
            }
            if result != WAIT_OBJECT_0 + 1 {
                warn!("WaitForMultipleObjects failed: {}", io::Error::last_os_error());
                return 0;
            }

            match reader.complete() {
                Ok(Some(len)) => return reader.copy_into(buf, len),
                Ok(None) => {
                    // Overflow: an entry with an empty name.
                    let len = records::FILE_NOTIFY_HEADER_LEN.min(buf.len());
                    buf[..len].fill(0);
                    return len;
                }
                Err(e) => {
                    trace!("directory read ended: {e}");
                    return 0;
                }
            }
        }
    }

    fn translate_changes(&self, buf: &[u8], emit: &mut Emit<'_>) -> ControlFlow<()> {
        let mut name = String::new();
        records::for_each_file_notify(buf, |_action, units| {
            if units.is_empty() {
                return emit(Change::Overflow);
            }
            name.clear();
            name.extend(
                char::decode_utf16(units.iter().copied())
                    .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER)),
            );
            emit(Change::Name(name.as_bytes()))
        })
    }

    fn deinit(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.signal_wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn entry(name: &str) -> Vec<u8> {
        let wide: Vec<u16> = name.encode_utf16().collect();
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&((wide.len() * 2) as u32).to_le_bytes());
        for unit in wide {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_translate_decodes_utf16() {
        let backend = Win32Backend::new(&MonitorConfig::new()).unwrap();
        let mut seen = Vec::new();
        let _ = backend.translate_changes(&entry("dossier\\été.txt"), &mut |change| {
            if let Change::Name(name) = change {
                seen.push(String::from_utf8(name.to_vec()).unwrap());
            }
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec!["dossier\\été.txt".to_string()]);
    }

    #[test]
    fn test_reports_created_file() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Win32Backend::new(&MonitorConfig::new()).unwrap();
        let id = backend.add(temp_dir.path()).unwrap();
        backend.remove(WatchId::new(-1));
        backend.remove(WatchId::new(id.as_raw() + 100));
        assert_eq!(*backend.current.lock(), Some(id));

        let writer = {
            let path = temp_dir.path().join("created.txt");
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                File::create(path).unwrap();
            })
        };

        let mut buf = vec![0u8; 4096];
        let len = backend.get_changes(&mut buf);
        writer.join().unwrap();

        let mut names = Vec::new();
        let _ = backend.translate_changes(&buf[..len], &mut |change| {
            if let Change::Name(name) = change {
                names.push(String::from_utf8_lossy(name).into_owned());
            }
            ControlFlow::Continue(())
        });
        assert!(names.iter().any(|name| name == "created.txt"));
    }

    #[test]
    fn test_stale_handle_does_not_stop_current_watch() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let backend = Win32Backend::new(&MonitorConfig::new()).unwrap();

        let previous = backend.add(first.path()).unwrap();
        let current = backend.add(second.path()).unwrap();
        assert_ne!(previous, current);

        backend.remove(previous);
        assert_eq!(*backend.current.lock(), Some(current));
        assert!(matches!(*backend.command.lock(), Some(Command::Watch(_))));

        backend.remove(current);
        assert_eq!(*backend.current.lock(), None);
        assert!(matches!(*backend.command.lock(), Some(Command::Unwatch)));
    }

    #[test]
    fn test_deinit_interrupts_wait() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(Win32Backend::new(&MonitorConfig::new()).unwrap());
        backend.add(temp_dir.path()).unwrap();

        let reader = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 4096];
                backend.get_changes(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        backend.deinit();
        assert_eq!(reader.join().unwrap(), 0);
    }
}
