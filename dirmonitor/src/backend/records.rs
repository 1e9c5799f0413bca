//! Raw record layouts shared by backends.
//!
//! Backends whose native events are not already a flat byte stream encode
//! them into one of two layouts before staging:
//!
//! - handle records: a native-endian `i32` per event,
//! - name records: a native-endian `u32` length followed by that many bytes.
//!
//! The Win32 `FILE_NOTIFY_INFORMATION` layout is parsed here too so that it
//! can be checked on every platform. All readers stop at the first record
//! that does not fit in the buffer.

use std::ops::ControlFlow;

use super::WatchId;

const HANDLE_LEN: usize = std::mem::size_of::<i32>();
const NAME_HEADER_LEN: usize = std::mem::size_of::<u32>();

/// Append a handle record. Returns false when the buffer is full.
pub fn write_handle(buf: &mut [u8], pos: &mut usize, id: WatchId) -> bool {
    let end = *pos + HANDLE_LEN;
    if end > buf.len() {
        return false;
    }
    buf[*pos..end].copy_from_slice(&id.as_raw().to_ne_bytes());
    *pos = end;
    true
}

/// Visit every complete handle record.
pub fn for_each_handle<F>(buf: &[u8], mut f: F) -> ControlFlow<()>
where
    F: FnMut(WatchId) -> ControlFlow<()>,
{
    for chunk in buf.chunks_exact(HANDLE_LEN) {
        let raw = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        f(WatchId::new(raw))?;
    }
    ControlFlow::Continue(())
}

/// Bytes a name record of `name_len` bytes occupies.
pub fn name_record_len(name_len: usize) -> usize {
    NAME_HEADER_LEN + name_len
}

/// Append a name record. Returns false when it does not fit.
pub fn write_name(buf: &mut [u8], pos: &mut usize, name: &[u8]) -> bool {
    let Ok(len) = u32::try_from(name.len()) else {
        return false;
    };
    let end = *pos + name_record_len(name.len());
    if end > buf.len() {
        return false;
    }
    buf[*pos..*pos + NAME_HEADER_LEN].copy_from_slice(&len.to_ne_bytes());
    buf[*pos + NAME_HEADER_LEN..end].copy_from_slice(name);
    *pos = end;
    true
}

/// Visit every complete name record.
pub fn for_each_name<F>(buf: &[u8], mut f: F) -> ControlFlow<()>
where
    F: FnMut(&[u8]) -> ControlFlow<()>,
{
    let mut pos = 0;
    while pos + NAME_HEADER_LEN <= buf.len() {
        let header = &buf[pos..pos + NAME_HEADER_LEN];
        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = pos + NAME_HEADER_LEN;
        let Some(end) = start.checked_add(len) else {
            break;
        };
        if end > buf.len() {
            break;
        }
        f(&buf[start..end])?;
        pos = end;
    }
    ControlFlow::Continue(())
}

/// Size of the fixed part of `FILE_NOTIFY_INFORMATION`.
pub const FILE_NOTIFY_HEADER_LEN: usize = 12;

/// Visit every entry of a `FILE_NOTIFY_INFORMATION` chain.
///
/// `f` receives the action code and the UTF-16 file name units.
pub fn for_each_file_notify<F>(buf: &[u8], mut f: F) -> ControlFlow<()>
where
    F: FnMut(u32, &[u16]) -> ControlFlow<()>,
{
    let mut pos = 0usize;
    let mut units = Vec::new();
    loop {
        if pos + FILE_NOTIFY_HEADER_LEN > buf.len() {
            break;
        }
        let next = read_u32_le(buf, pos) as usize;
        let action = read_u32_le(buf, pos + 4);
        let name_len = read_u32_le(buf, pos + 8) as usize;
        let name_start = pos + FILE_NOTIFY_HEADER_LEN;
        let Some(name_end) = name_start.checked_add(name_len) else {
            break;
        };
        if name_end > buf.len() {
            break;
        }

        units.clear();
        units.extend(
            buf[name_start..name_end]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
        );
        f(action, &units)?;

        // A zero offset ends the chain; anything that does not move past the
        // header is malformed.
        if next == 0 || next < FILE_NOTIFY_HEADER_LEN {
            break;
        }
        pos += next;
    }
    ControlFlow::Continue(())
}

fn read_u32_le(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}
