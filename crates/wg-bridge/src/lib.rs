//! WireGuard Android host bridge
//!
//! Lets the Android app run userspace tunnels over the descriptor handed
//! out by `VpnService.Builder.establish()`. The app calls `wgTurnOn` with
//! that descriptor and a configuration, gets back a small integer handle,
//! and later uses the handle to fetch the tunnel's UDP sockets (so it can
//! `protect()` them) and to stop the tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  GoBackend.java                                           │
//! └──────────────┬────────────────────────────────────────────┘
//!                │ JNI / C ABI (ffi, jni)
//! ┌──────────────▼────────────────────────────────────────────┐
//! │  Backend                                                  │
//! │   ├── Registry<Tunnel>      handle -> tunnel              │
//! │   ├── FdTun (wg-tun)        host fd as a cancellable Tun  │
//! │   ├── ControlChannel        <uapi_dir>/<iface>.sock       │
//! │   └── DeviceFactory         engine supplied by embedder   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The tunnel engine itself is not part of this crate. It is plugged in
//! through [`DeviceFactory`] with [`ffi::install`].

pub mod backend;
pub mod config;
pub mod device;
pub mod diag;
pub mod ffi;
pub mod logging;
pub mod registry;
pub mod uapi;

#[cfg(feature = "jni")]
pub mod android;

pub use backend::{Backend, TurnOn, Tunnel, VERSION, version};
pub use config::{BridgeConfig, ConfigError, EngineOptions};
pub use device::{BindError, Device, DeviceFactory, IpFamily, IpcError};
pub use logging::{LogLevel, LogSink, LogWriter, Logger, StderrLogSink};
pub use registry::{Handle, Registry, RegistryError};
pub use uapi::{ControlChannel, ControlListener};

#[cfg(target_os = "android")]
pub use logging::AndroidLogSink;

pub use wg_tun::{ChannelTun, FdTun, Tun, TunError, TunEvent, TunOptions};
