//! TUN device over a descriptor detached from the host.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

use super::{EVENT_QUEUE_CAPACITY, Tun, TunError, TunEvent, sys};

/// Kernel limit on interface names, including the NUL.
const IFNAMSIZ: usize = 16;
use crate::rwcancel::RwCancel;

/// How to resolve interface identity for a new [`FdTun`].
#[derive(Debug, Clone)]
pub struct TunOptions {
    /// Used when the descriptor cannot report its own name
    pub name: Option<String>,
    /// Explicit MTU; queried from the interface when `None`
    pub mtu: Option<u32>,
    /// Used when no MTU was given and the query fails
    pub default_mtu: u32,
}

impl Default for TunOptions {
    fn default() -> Self {
        Self {
            name: None,
            mtu: None,
            default_mtu: 1280,
        }
    }
}

impl TunOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }
}

/// Descriptor plus its cancellation pipe. Dropped together on close.
struct Io {
    rw: RwCancel,
    fd: OwnedFd,
}

/// Named TUN adapter over a host-owned descriptor.
///
/// Reads park in `poll(2)` and are woken by [`Tun::close`]; the descriptor
/// is closed exactly once, after every in-flight read has returned.
pub struct FdTun {
    io: RwLock<Option<Io>>,
    name: String,
    mtu: AtomicU32,
    events_tx: Mutex<Option<Sender<TunEvent>>>,
    events_rx: Receiver<TunEvent>,
    errors_rx: Receiver<TunError>,
    // Held so the error queue stays connected for the device's lifetime.
    _errors_tx: Sender<TunError>,
    closed: AtomicBool,
}

impl FdTun {
    /// Adapt `fd` into a TUN device.
    ///
    /// On error the caller still owns `fd` and must close it.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor that nothing else will close once
    /// this returns `Ok`; the adapter closes it from [`Tun::close`] or drop.
    pub unsafe fn from_raw_fd(fd: RawFd, options: TunOptions) -> Result<Self, TunError> {
        let rw = RwCancel::new(fd)?;

        let name = match sys::interface_name(fd) {
            Ok(name) if !name.is_empty() => name,
            Ok(_) | Err(_) => match options.name {
                Some(name) if !name.is_empty() => name,
                _ => return Err(TunError::NoName),
            },
        };
        check_name(&name)?;

        let mtu = match options.mtu {
            Some(mtu) => mtu,
            None => sys::interface_mtu(&name).unwrap_or_else(|e| {
                debug!("MTU query for {} failed ({}), using {}", name, e, options.default_mtu);
                options.default_mtu
            }),
        };

        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let _ = events_tx.try_send(TunEvent::Up);

        // SAFETY: ownership transfer documented on this function.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self {
            io: RwLock::new(Some(Io { rw, fd })),
            name,
            mtu: AtomicU32::new(mtu),
            events_tx: Mutex::new(Some(events_tx)),
            events_rx,
            errors_rx,
            _errors_tx: errors_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn interface_name(&self) -> &str {
        &self.name
    }

    pub fn current_mtu(&self) -> u32 {
        self.mtu.load(Ordering::SeqCst)
    }

    /// Raw descriptor, or `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.io
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|io| io.fd.as_raw_fd())
    }

    /// Override the MTU; the engine learns about it through the event queue.
    pub fn set_mtu(&self, mtu: u32) {
        if self.mtu.swap(mtu, Ordering::SeqCst) != mtu {
            self.push_event(TunEvent::MtuUpdate(mtu));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push_event(&self, event: TunEvent) {
        let guard = self.events_tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            if let Err(TrySendError::Full(event)) = tx.try_send(event) {
                warn!("{}: event queue full, dropping {:?}", self.name, event);
            }
        }
    }

    fn map_cancel(&self, err: TunError) -> TunError {
        match err {
            TunError::Cancelled if self.is_closed() => TunError::Closed,
            other => other,
        }
    }
}

/// Interface names also name control sockets: one short path component.
fn check_name(name: &str) -> Result<(), TunError> {
    let valid = !name.is_empty()
        && name.len() < IFNAMSIZ
        && name != "."
        && name != ".."
        && !name.contains(['/', '\0']);
    if valid {
        Ok(())
    } else {
        Err(TunError::InvalidName(name.to_owned()))
    }
}

impl Tun for FdTun {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        let guard = self.io.read().unwrap_or_else(PoisonError::into_inner);
        let io = guard.as_ref().ok_or(TunError::Closed)?;
        io.rw.read(buf).map_err(|e| self.map_cancel(e.into()))
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TunError> {
        let guard = self.io.read().unwrap_or_else(PoisonError::into_inner);
        let io = guard.as_ref().ok_or(TunError::Closed)?;
        io.rw.write(buf).map_err(|e| self.map_cancel(e.into()))
    }

    fn name(&self) -> Result<String, TunError> {
        Ok(self.name.clone())
    }

    fn mtu(&self) -> Result<u32, TunError> {
        Ok(self.current_mtu())
    }

    fn events(&self) -> Receiver<TunEvent> {
        self.events_rx.clone()
    }

    fn errors(&self) -> Receiver<TunError> {
        self.errors_rx.clone()
    }

    fn close(&self) -> Result<(), TunError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.push_event(TunEvent::Down);
        self.events_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Wake readers first so they drop their read guards.
        if let Some(io) = self.io.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            io.rw.cancel();
        }

        let io = self.io.write().unwrap_or_else(PoisonError::into_inner).take();
        if io.is_some() {
            debug!("{}: closing tun descriptor", self.name);
        }
        drop(io);
        Ok(())
    }
}

impl Drop for FdTun {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for FdTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTun")
            .field("name", &self.name)
            .field("mtu", &self.current_mtu())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn adapt(options: TunOptions) -> (FdTun, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        let tun = unsafe { FdTun::from_raw_fd(ours.into_raw_fd(), options) }.unwrap();
        (tun, peer)
    }

    #[test]
    fn test_supplied_name_used_for_non_tun_descriptor() {
        let (tun, _peer) = adapt(TunOptions::default().with_name("wg0").with_mtu(1420));

        assert_eq!(tun.name().unwrap(), "wg0");
        assert_eq!(tun.mtu().unwrap(), 1420);
    }

    #[test]
    fn test_missing_name_leaves_descriptor_with_caller() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();

        let result = unsafe { FdTun::from_raw_fd(fd, TunOptions::default()) };
        assert!(matches!(result, Err(TunError::NoName)));

        // Still open: `ours` is the owner
        let mut ours = ours;
        peer.write_all(b"!").unwrap();
        let mut buf = [0u8; 1];
        ours.set_nonblocking(false).unwrap();
        ours.read_exact(&mut buf).unwrap();
    }

    #[test]
    fn test_default_mtu_when_query_fails() {
        let options = TunOptions {
            name: Some("nosuchif9".into()),
            mtu: None,
            default_mtu: 1280,
        };
        let (tun, _peer) = adapt(options);
        assert_eq!(tun.current_mtu(), 1280);
    }

    #[test]
    fn test_packets_flow_both_ways() {
        let (tun, mut peer) = adapt(TunOptions::default().with_name("wg0"));

        peer.write_all(b"inbound").unwrap();
        let mut buf = [0u8; 32];
        let n = tun.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"inbound");

        tun.write(b"outbound").unwrap();
        let mut out = [0u8; 8];
        peer.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"outbound");
    }

    #[test]
    fn test_close_wakes_reader_and_releases_descriptor() {
        let (tun, mut peer) = adapt(TunOptions::default().with_name("wg0"));
        let tun = Arc::new(tun);

        let (tx, rx) = mpsc::channel();
        let reader = Arc::clone(&tun);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 16];
            tx.send(reader.read(&mut buf)).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        tun.close().unwrap();

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(TunError::Closed)));
        handle.join().unwrap();

        // Our end is gone, so the peer sees EOF
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);

        assert!(tun.raw_fd().is_none());
        assert!(tun.close().is_ok());
        assert!(matches!(tun.write(b"late"), Err(TunError::Closed)));
    }

    #[test]
    fn test_events_up_then_mtu_then_down() {
        let (tun, _peer) = adapt(TunOptions::default().with_name("wg0").with_mtu(1280));
        let events = tun.events();

        assert_eq!(events.try_recv().unwrap(), TunEvent::Up);

        tun.set_mtu(1280);
        assert!(events.try_recv().is_err());

        tun.set_mtu(1400);
        assert_eq!(events.try_recv().unwrap(), TunEvent::MtuUpdate(1400));

        tun.close().unwrap();
        assert_eq!(events.try_recv().unwrap(), TunEvent::Down);
        assert!(events.recv_timeout(Duration::from_millis(100)).is_err());

        // Closing again reports nothing new
        tun.close().unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_unsafe_names_rejected() {
        for bad in ["../victim", "a/b", ".", "..", "wg\0", "name-way-too-long"] {
            let (ours, mut peer) = UnixStream::pair().unwrap();
            let fd = ours.as_raw_fd();

            let result = unsafe { FdTun::from_raw_fd(fd, TunOptions::default().with_name(bad)) };
            assert!(matches!(result, Err(TunError::InvalidName(_))), "{bad:?}");

            // The caller still owns the descriptor
            peer.write_all(b"!").unwrap();
            let mut ours = ours;
            let mut buf = [0u8; 1];
            ours.read_exact(&mut buf).unwrap();
        }

        let (tun, _peer) = adapt(TunOptions::default().with_name("wg-home.1"));
        assert_eq!(tun.interface_name(), "wg-home.1");
    }
}
