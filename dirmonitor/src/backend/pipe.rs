//! Self-pipe used to interrupt blocking native waits.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A non-blocking, close-on-exec pipe.
///
/// Writing one byte makes the read end permanently readable; it is never
/// drained, so every later wait returns immediately as well.
#[derive(Debug)]
pub(crate) struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SignalPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe() writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe() succeeded, so both descriptors are open and owned here.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_flags(fd)?;
        }

        Ok(Self { read, write })
    }

    /// Descriptor to include in poll/kevent sets.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Make the read end readable.
    pub(crate) fn signal(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack value to an owned descriptor.
        let written = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                (&byte as *const u8).cast(),
                1,
            )
        };
        if written != 1 {
            tracing::trace!(
                "signal pipe write returned {written}: {}",
                io::Error::last_os_error()
            );
        }
    }
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no pointers are passed.
    unsafe {
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd, zero timeout.
        let ready = unsafe { libc::poll(&mut pfd, 1, 0) };
        ready == 1 && pfd.revents & libc::POLLIN != 0
    }

    #[test]
    fn test_signal_makes_read_end_readable() {
        let pipe = SignalPipe::new().unwrap();
        assert!(!readable(pipe.read_fd()));

        pipe.signal();
        assert!(readable(pipe.read_fd()));

        // Stays readable for later waits.
        pipe.signal();
        assert!(readable(pipe.read_fd()));
    }
}
