//! Engine collaborator
//!
//! The bridge never implements the tunnel protocol. It drives an engine
//! through [`Device`] and builds one per tunnel through a [`DeviceFactory`]
//! registered by the embedding application.

use std::io::{self, BufRead, Write};
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use wg_tun::Tun;

use crate::config::EngineOptions;
use crate::logging::Logger;

/// Address family of an engine transport socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Failure of a configuration get/set, carrying a UAPI errno.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("IPC error {code}: {message}")]
pub struct IpcError {
    pub code: i64,
    pub message: String,
}

impl IpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<io::Error> for IpcError {
    fn from(err: io::Error) -> Self {
        let code = err.raw_os_error().unwrap_or(libc::EIO);
        Self::new(i64::from(code), err.to_string())
    }
}

/// Why a transport socket could not be reported
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The engine has no socket bound for this family
    #[error("no socket bound")]
    NotBound,

    /// The transport binding cannot expose raw descriptors
    #[error("transport binding does not expose sockets")]
    Unsupported,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One running tunnel engine.
///
/// All methods may be called from any thread.
pub trait Device: Send + Sync {
    /// Apply a configuration payload in the engine's text format.
    fn ipc_set_operation(&self, reader: &mut dyn BufRead) -> Result<(), IpcError>;

    /// Write the current configuration in the engine's text format.
    fn ipc_get_operation(&self, writer: &mut dyn Write) -> Result<(), IpcError>;

    /// Serve one control connection until the peer hangs up.
    fn ipc_handle(&self, conn: UnixStream);

    fn up(&self);

    /// Stop the engine. Must close the [`Tun`] it was created with.
    fn close(&self);

    /// Descriptor of the UDP socket for `family`, still owned by the engine.
    fn peek_socket_fd(&self, family: IpFamily) -> Result<RawFd, BindError>;
}

/// Constructs engines over adapted interfaces.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, tun: Box<dyn Tun>, logger: Logger, options: &EngineOptions) -> Arc<dyn Device>;
}

impl<F> DeviceFactory for F
where
    F: Fn(Box<dyn Tun>, Logger, &EngineOptions) -> Arc<dyn Device> + Send + Sync,
{
    fn create(&self, tun: Box<dyn Tun>, logger: Logger, options: &EngineOptions) -> Arc<dyn Device> {
        self(tun, logger, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_error_from_io() {
        let err = IpcError::from(io::Error::from_raw_os_error(libc::EINVAL));
        assert_eq!(err.code, i64::from(libc::EINVAL));

        let err = IpcError::from(io::Error::new(io::ErrorKind::Other, "bad key"));
        assert_eq!(err.code, i64::from(libc::EIO));
        assert!(err.to_string().contains("bad key"));
    }

    #[test]
    fn test_family_display() {
        assert_eq!(IpFamily::V4.to_string(), "IPv4");
        assert_eq!(IpFamily::V6.to_string(), "IPv6");
    }
}
