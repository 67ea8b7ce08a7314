//! C ABI
//!
//! The host loads `libwg.so` and calls these symbols. They forward to the
//! process-wide [`Backend`] that the embedding engine registers with
//! [`install`] from its library constructor or `JNI_OnLoad`.
//!
//! No call unwinds into the host: panics become the failure value, `-1` or
//! null. Calls made before [`install`] fail the same way.

use anyhow::{Context, bail};
use std::ffi::{CStr, CString, c_char};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

use crate::backend::{Backend, TurnOn, release_fd};
use crate::config::BridgeConfig;
use crate::device::DeviceFactory;
use crate::diag;
use crate::logging::{self, LogSink};
use crate::registry::Handle;

static BACKEND: OnceLock<Backend> = OnceLock::new();

/// Register the engine factory with configuration from the environment.
pub fn install(factory: impl DeviceFactory + 'static) -> anyhow::Result<&'static Backend> {
    let config = BridgeConfig::load().context("Failed to load bridge configuration")?;
    install_with(config, Box::new(factory), logging::platform_sink())
}

/// Register the process backend: logging, the stack dump watcher, and
/// the tunnel registry. Only the first call succeeds.
pub fn install_with(
    config: BridgeConfig,
    factory: Box<dyn DeviceFactory>,
    sink: Arc<dyn LogSink>,
) -> anyhow::Result<&'static Backend> {
    config.validate()?;

    let mut created = false;
    let backend = BACKEND.get_or_init(|| {
        created = true;
        Backend::new(config, factory, sink)
    });
    if !created {
        bail!("Backend already installed");
    }

    logging::init(backend.config(), backend.sink());

    if backend.config().stack_dump_signal {
        let installed = diag::install(backend.sink(), &backend.config().log_tag, move || {
            backend.live_handles()
        });
        if let Err(e) = installed {
            warn!("Stack dump handler unavailable: {}", e);
        }
    }

    Ok(backend)
}

/// The installed backend, if any
pub fn backend() -> Option<&'static Backend> {
    BACKEND.get()
}

pub(crate) fn ffi_guard<R>(fallback: R, f: impl FnOnce() -> R) -> R {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!("Panic in exported call");
        fallback
    })
}

/// Shared body of the C and JNI `wgTurnOn`. `mtu <= 0` queries the interface.
pub(crate) fn turn_on(interface_name: &str, tun_fd: i32, mtu: i32, settings: &str) -> i32 {
    let Some(backend) = backend() else {
        error!("wgTurnOn called before the backend was installed");
        release_fd(tun_fd);
        return Handle::INVALID;
    };

    let request = TurnOn {
        interface_name,
        tun_fd,
        mtu: u32::try_from(mtu).ok().filter(|&mtu| mtu > 0),
        settings,
    };
    match backend.turn_on(request) {
        Ok(handle) => handle.get(),
        Err(_) => Handle::INVALID,
    }
}

pub(crate) fn socket(handle: i32, v6: bool) -> i32 {
    let Some(backend) = backend() else {
        return -1;
    };
    let fd = if v6 {
        backend.socket_v6(handle)
    } else {
        backend.socket_v4(handle)
    };
    fd.unwrap_or(-1)
}

pub(crate) fn config_text(handle: i32) -> Option<String> {
    backend()?.config_text(handle)
}

/// Start a tunnel. Returns its handle, or -1.
///
/// `tun_fd` belongs to the bridge after this call, whatever the outcome.
///
/// # Safety
///
/// `ifname` and `settings` must be null or point to NUL-terminated strings.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "C" fn wgTurnOn(
    ifname: *const c_char,
    tun_fd: i32,
    mtu: i32,
    settings: *const c_char,
) -> i32 {
    ffi_guard(Handle::INVALID, || {
        if ifname.is_null() || settings.is_null() {
            release_fd(tun_fd);
            return Handle::INVALID;
        }
        // SAFETY: non-null and NUL-terminated per the contract above.
        let (ifname, settings) = unsafe { (CStr::from_ptr(ifname), CStr::from_ptr(settings)) };
        match (ifname.to_str(), settings.to_str()) {
            (Ok(ifname), Ok(settings)) => turn_on(ifname, tun_fd, mtu, settings),
            _ => {
                error!("wgTurnOn: arguments are not UTF-8");
                release_fd(tun_fd);
                Handle::INVALID
            }
        }
    })
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "C" fn wgTurnOff(handle: i32) {
    ffi_guard((), || {
        if let Some(backend) = backend() {
            backend.turn_off(handle);
        }
    })
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "C" fn wgGetSocketV4(handle: i32) -> i32 {
    ffi_guard(-1, || socket(handle, false))
}

#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "C" fn wgGetSocketV6(handle: i32) -> i32 {
    ffi_guard(-1, || socket(handle, true))
}

/// Current configuration text, or null. Free with [`wgFreeString`].
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "C" fn wgGetConfig(handle: i32) -> *mut c_char {
    ffi_guard(std::ptr::null_mut(), || {
        config_text(handle)
            .and_then(|text| CString::new(text).ok())
            .map_or(std::ptr::null_mut(), CString::into_raw)
    })
}

/// # Safety
///
/// `s` must be null or a pointer returned by [`wgGetConfig`] that has not
/// been freed yet.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "C" fn wgFreeString(s: *mut c_char) {
    if !s.is_null() {
        // SAFETY: allocated by CString::into_raw in wgGetConfig.
        drop(unsafe { CString::from_raw(s) });
    }
}

/// Static NUL-terminated version string.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub extern "C" fn wgVersion() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr().cast()
}
