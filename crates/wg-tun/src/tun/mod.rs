//! Network interface capability
//!
//! A tunnel engine never sees a file descriptor. It gets a `dyn Tun`, which
//! may be a host descriptor ([`FdTun`]) or an in-memory loopback
//! ([`ChannelTun`]) in tests.

mod channel;
mod fd;
mod sys;

pub use channel::ChannelTun;
pub use fd::{FdTun, TunOptions};

use crossbeam_channel::Receiver;
use std::io;

use crate::rwcancel::CancelError;

/// Capacity of the event and error queues of every adapter.
pub const EVENT_QUEUE_CAPACITY: usize = 5;

/// Adapter-level conditions pushed to the engine asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    /// Interface is ready for traffic
    Up,
    /// Adapter closed; nothing follows
    Down,
    /// MTU changed to the given value
    MtuUpdate(u32),
}

/// TUN adapter errors
#[derive(Debug, thiserror::Error)]
pub enum TunError {
    /// A blocked read or write was interrupted by teardown
    #[error("operation cancelled")]
    Cancelled,

    #[error("device closed")]
    Closed,

    #[error("interface name unavailable")]
    NoName,

    /// Not usable as an interface name or as a file name
    #[error("invalid interface name {0:?}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CancelError> for TunError {
    fn from(err: CancelError) -> Self {
        match err {
            CancelError::Cancelled => TunError::Cancelled,
            CancelError::Io(e) => TunError::Io(e),
        }
    }
}

/// What a tunnel engine requires of a network interface.
///
/// Implementations are shared between the engine's reader and writer
/// threads and the teardown path, so every method takes `&self`.
pub trait Tun: Send + Sync {
    /// Read one packet. Blocks until a packet arrives or the device closes.
    fn read(&self, buf: &mut [u8]) -> Result<usize, TunError>;

    /// Write one packet.
    fn write(&self, buf: &[u8]) -> Result<usize, TunError>;

    /// Interface name, resolved once at construction.
    fn name(&self) -> Result<String, TunError>;

    fn mtu(&self) -> Result<u32, TunError>;

    /// Event queue. Disconnects once the device is closed and drained.
    fn events(&self) -> Receiver<TunEvent>;

    fn errors(&self) -> Receiver<TunError>;

    /// Interrupt pending reads and release the device. Idempotent.
    fn close(&self) -> Result<(), TunError>;
}

impl<T: Tun + ?Sized> Tun for Box<T> {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        (**self).read(buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TunError> {
        (**self).write(buf)
    }

    fn name(&self) -> Result<String, TunError> {
        (**self).name()
    }

    fn mtu(&self) -> Result<u32, TunError> {
        (**self).mtu()
    }

    fn events(&self) -> Receiver<TunEvent> {
        (**self).events()
    }

    fn errors(&self) -> Receiver<TunError> {
        (**self).errors()
    }

    fn close(&self) -> Result<(), TunError> {
        (**self).close()
    }
}
