//! Interface introspection through ioctls.
//!
//! Only Linux and Android can ask a TUN descriptor for its name. Everywhere
//! else these return `Unsupported` and callers fall back to supplied values.

use std::io;
use std::os::fd::RawFd;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::ffi::CStr;
    use std::io;
    use std::os::fd::{FromRawFd, OwnedFd, RawFd};

    /// `_IOR('T', 210, unsigned int)`
    const TUNGETIFF: libc::c_ulong = 0x8004_54d2;
    const SIOCGIFMTU: libc::c_ulong = 0x8921;

    /// `struct ifreq`: name followed by a 24-byte union.
    #[repr(C)]
    struct IfReq {
        name: [libc::c_char; libc::IFNAMSIZ],
        data: [u8; 24],
    }

    impl IfReq {
        fn zeroed() -> Self {
            Self {
                name: [0; libc::IFNAMSIZ],
                data: [0; 24],
            }
        }

        fn with_name(name: &str) -> io::Result<Self> {
            let bytes = name.as_bytes();
            if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid interface name {name:?}"),
                ));
            }
            let mut ifr = Self::zeroed();
            for (dst, &src) in ifr.name.iter_mut().zip(bytes) {
                *dst = src as libc::c_char;
            }
            Ok(ifr)
        }
    }

    pub fn interface_name(fd: RawFd) -> io::Result<String> {
        let mut ifr = IfReq::zeroed();
        if unsafe { libc::ioctl(fd, TUNGETIFF as _, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel NUL-terminates ifr_name and the buffer is zeroed.
        let name = unsafe { CStr::from_ptr(ifr.name.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    pub fn interface_mtu(name: &str) -> io::Result<u32> {
        let mut ifr = IfReq::with_name(name)?;

        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: socket(2) returned a fresh descriptor.
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ioctl(std::os::fd::AsRawFd::as_raw_fd(&sock), SIOCGIFMTU as _, &mut ifr) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let mtu = libc::c_int::from_ne_bytes([ifr.data[0], ifr.data[1], ifr.data[2], ifr.data[3]]);
        u32::try_from(mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MTU"))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use std::io;
    use std::os::fd::RawFd;

    pub fn interface_name(_fd: RawFd) -> io::Result<String> {
        Err(io::ErrorKind::Unsupported.into())
    }

    pub fn interface_mtu(_name: &str) -> io::Result<u32> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

/// Ask the kernel which interface a TUN descriptor is attached to.
pub fn interface_name(fd: RawFd) -> io::Result<String> {
    imp::interface_name(fd)
}

pub fn interface_mtu(name: &str) -> io::Result<u32> {
    imp::interface_mtu(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_non_tun_descriptor_has_no_name() {
        let (ours, _peer) = UnixStream::pair().unwrap();
        assert!(interface_name(ours.as_raw_fd()).is_err());
    }

    #[test]
    fn test_invalid_name_rejected() {
        assert!(interface_mtu("").is_err());
        assert!(interface_mtu("name-way-too-long-for-ifreq").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_mtu() {
        // Containers without a loopback device are rare but exist
        if let Ok(mtu) = interface_mtu("lo") {
            assert!(mtu >= 1280);
        }
    }
}
