//! Cancellable I/O on a borrowed descriptor
//!
//! The host owns the TUN descriptor, so teardown cannot close it to kick a
//! reader out of `read(2)`. Instead the descriptor is switched to
//! non-blocking mode and every wait goes through `poll(2)` on two
//! descriptors: the TUN itself and the read end of a private pipe. Writing a
//! byte into the pipe wakes every waiter at once.
//!
//! ```text
//!  reader thread                      teardown thread
//!  ─────────────                      ───────────────
//!  read() -> EAGAIN
//!  poll([fd, pipe_r]) ── blocks ──┐
//!                                 │   cancel(): write(pipe_w, 1 byte)
//!  pipe_r readable  <─────────────┘
//!  return Cancelled
//! ```

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// Result of a wait that did not produce data.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// `cancel()` was called; the descriptor itself is fine.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CancelError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CancelError::Cancelled)
    }
}

/// Interruptible reader/writer over a descriptor it does not own.
///
/// Dropping (or [`RwCancel::close`]) releases the cancellation pipe only.
/// The wrapped descriptor stays open and stays in non-blocking mode.
pub struct RwCancel {
    fd: RawFd,
    cancel_r: OwnedFd,
    cancel_w: OwnedFd,
    cancelled: AtomicBool,
}

impl RwCancel {
    /// Wrap `fd`, switching it to non-blocking mode.
    ///
    /// Fails if `fd` is not an open descriptor.
    pub fn new(fd: RawFd) -> io::Result<Self> {
        set_nonblocking(fd)?;
        let (cancel_r, cancel_w) = cloexec_pipe()?;

        Ok(Self {
            fd,
            cancel_r,
            cancel_w,
            cancelled: AtomicBool::new(false),
        })
    }

    /// The wrapped descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read into `buf`, blocking until data arrives, the descriptor fails,
    /// or another thread calls [`cancel`](Self::cancel).
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, CancelError> {
        loop {
            if self.is_cancelled() {
                return Err(CancelError::Cancelled);
            }

            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.ready(libc::POLLIN)?,
                io::ErrorKind::Interrupted => {}
                _ => return Err(err.into()),
            }
        }
    }

    /// Write `buf`, blocking while the descriptor is not writable.
    pub fn write(&self, buf: &[u8]) -> Result<usize, CancelError> {
        loop {
            if self.is_cancelled() {
                return Err(CancelError::Cancelled);
            }

            let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.ready(libc::POLLOUT)?,
                io::ErrorKind::Interrupted => {}
                _ => return Err(err.into()),
            }
        }
    }

    /// Block until the descriptor is readable or the wait is cancelled.
    ///
    /// Used by callers that do their own non-blocking syscall, such as
    /// `accept(2)` on a listening socket.
    pub fn wait_readable(&self) -> Result<(), CancelError> {
        if self.is_cancelled() {
            return Err(CancelError::Cancelled);
        }
        self.ready(libc::POLLIN)
    }

    /// Wake every current and future waiter. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        // The byte is never drained, so the pipe stays readable for good.
        let byte = 1u8;
        let n = unsafe { libc::write(self.cancel_w.as_raw_fd(), (&byte as *const u8).cast(), 1) };
        if n < 0 {
            tracing::warn!(
                "cancel pipe write failed for fd {}: {}",
                self.fd,
                io::Error::last_os_error()
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Release the cancellation pipe. The wrapped descriptor is left open.
    pub fn close(self) {
        drop(self);
    }

    fn ready(&self, events: libc::c_short) -> Result<(), CancelError> {
        let mut fds = [
            libc::pollfd {
                fd: self.fd,
                events,
                revents: 0,
            },
            libc::pollfd {
                fd: self.cancel_r.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            if fds[1].revents != 0 {
                return Err(CancelError::Cancelled);
            }
            // Error and hangup conditions are reported by the next syscall.
            if fds[0].revents != 0 {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for RwCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwCancel")
            .field("fd", &self.fd)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pipe2(2) just returned two fresh descriptors we now own.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_returns_available_data() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let rw = RwCancel::new(ours.as_raw_fd()).unwrap();

        peer.write_all(b"hello").unwrap();

        let mut buf = [0u8; 16];
        let n = rw.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_cancel_unblocks_pending_read() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let rw = Arc::new(RwCancel::new(ours.as_raw_fd()).unwrap());

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&rw);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 16];
            tx.send(reader.read(&mut buf)).unwrap();
        });

        // Give the reader time to park in poll(2)
        thread::sleep(Duration::from_millis(50));
        rw.cancel();

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(CancelError::Cancelled)));
        handle.join().unwrap();

        // The descriptor survived the cancellation
        peer.write_all(b"x").unwrap();
        let mut ours = ours;
        let mut buf = [0u8; 1];
        assert_eq!(ours.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let rw = RwCancel::new(ours.as_raw_fd()).unwrap();

        rw.cancel();
        rw.cancel();

        assert!(rw.is_cancelled());
        let mut buf = [0u8; 4];
        assert!(rw.read(&mut buf).unwrap_err().is_cancelled());
        assert!(rw.wait_readable().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_close_keeps_descriptor_open() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let rw = RwCancel::new(ours.as_raw_fd()).unwrap();
        rw.close();

        let mut ours = ours;
        peer.write_all(b"ok").unwrap();
        let mut buf = [0u8; 2];
        ours.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[test]
    fn test_cancel_pipe_is_close_on_exec() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        let rw = RwCancel::new(ours.as_raw_fd()).unwrap();

        for fd in [&rw.cancel_r, &rw.cancel_w] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
            assert!(flags >= 0);
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        assert!(RwCancel::new(-1).is_err());
    }

    #[test]
    fn test_write_reaches_peer() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let rw = RwCancel::new(ours.as_raw_fd()).unwrap();

        assert_eq!(rw.write(b"ping").unwrap(), 4);

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
