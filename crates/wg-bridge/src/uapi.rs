//! Control channel
//!
//! Each tunnel exposes a Unix socket at `<uapi_dir>/<iface>.sock` that
//! configuration tools connect to. One thread accepts connections and every
//! connection is served by the engine on a thread of its own.
//!
//! ```text
//!  uapi-wg0 thread                       turn_off
//!  ───────────────                       ────────
//!  accept() ── conn ──▶ spawn(ipc_handle)
//!  accept() ── parked in poll ──┐
//!                               │        ControlChannel::close()
//!  accept() -> Err  ◀───────────┘          cancels, joins, unlinks
//!  thread exits
//! ```

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};
use wg_tun::{CancelError, RwCancel};

use crate::device::Device;

/// Bound control socket whose `accept` can be interrupted.
pub struct ControlListener {
    listener: UnixListener,
    cancel: RwCancel,
    path: PathBuf,
}

impl ControlListener {
    /// Bind `path`, replacing a stale socket file left by a dead process.
    ///
    /// Fails with `AddrInUse` if something still answers on `path`, and
    /// with `AlreadyExists` if `path` is anything other than a socket.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let cancel = RwCancel::new(listener.as_raw_fd())?;

        Ok(Self {
            listener,
            cancel,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next connection. Fails for good once closed.
    pub fn accept(&self) -> io::Result<UnixStream> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(closed());
            }

            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match self.cancel.wait_readable() {
                        Ok(()) => continue,
                        Err(CancelError::Cancelled) => return Err(closed()),
                        Err(CancelError::Io(e)) => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Make every current and future `accept` fail.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl std::fmt::Debug for ControlListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlListener")
            .field("path", &self.path)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Clear `path` for binding. Only a socket nobody listens on is removed.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    if is_listening(path)? {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use", path.display()),
        ));
    }

    debug!(path = %path.display(), "Removing stale control socket");
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether a listener answers on the socket at `path`.
///
/// Connects without blocking, so a full backlog still counts as live. A
/// live listener sees one connection that closes without sending anything.
fn is_listening(path: &Path) -> io::Result<bool> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is too long for a socket path", path.display()),
        ));
    }
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }

    let raw = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socket(2) returned a fresh descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let rc = unsafe {
        libc::connect(
            sock.as_raw_fd(),
            (&addr as *const libc::sockaddr_un).cast(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(true),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => Ok(false),
        _ => Err(err),
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "control listener closed")
}

/// A listener plus the thread accepting on it.
pub struct ControlChannel {
    listener: Arc<ControlListener>,
    acceptor: Option<JoinHandle<()>>,
}

impl ControlChannel {
    /// Start accepting on `listener`, handing connections to `device`.
    pub fn spawn(listener: ControlListener, device: Arc<dyn Device>, interface: &str) -> io::Result<Self> {
        let listener = Arc::new(listener);
        let accepting = Arc::clone(&listener);
        let name = interface.to_owned();

        let acceptor = thread::Builder::new()
            .name(format!("uapi-{interface}"))
            .spawn(move || accept_loop(&accepting, device, &name))?;

        Ok(Self {
            listener,
            acceptor: Some(acceptor),
        })
    }

    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Stop accepting and wait for the accept thread to exit.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.listener.close();
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("Control acceptor for {} panicked", self.listener.path().display());
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("path", &self.listener.path())
            .field("running", &self.acceptor.is_some())
            .finish()
    }
}

fn accept_loop(listener: &ControlListener, device: Arc<dyn Device>, interface: &str) {
    loop {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                debug!(iface = interface, "Control acceptor stopped: {}", e);
                return;
            }
        };

        let device = Arc::clone(&device);
        let spawned = thread::Builder::new()
            .name(format!("uapi-conn-{interface}"))
            .spawn(move || device.ipc_handle(conn));
        if let Err(e) = spawned {
            warn!(iface = interface, "Failed to spawn control handler: {}", e);
        }
    }
}
