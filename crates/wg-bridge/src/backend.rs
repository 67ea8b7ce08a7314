//! Tunnel lifecycle
//!
//! [`Backend`] owns every running tunnel of the process and implements the
//! four host operations on top of the registry, the TUN adapter, the
//! control channel and the engine factory.
//!
//! ```text
//!  turn_on:  adapt fd ─▶ create engine ─▶ apply config ─▶ bind control socket
//!            ─▶ up ─▶ start acceptor ─▶ allocate handle
//!  turn_off: remove handle ─▶ close control channel ─▶ close engine
//! ```
//!
//! Any failure before the handle is allocated releases the host's fd and
//! yields no handle. A control socket failure only costs the control
//! channel.

use anyhow::{Context, bail};
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, info};
use wg_tun::{FdTun, TunOptions};

use crate::config::BridgeConfig;
use crate::device::{Device, DeviceFactory, IpFamily};
use crate::logging::{LogSink, Logger};
use crate::registry::{Handle, Registry, RegistryError};
use crate::uapi::{ControlChannel, ControlListener};

/// Bridge version reported to the host
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

/// A started tunnel: the engine plus its control channel, if any.
pub struct Tunnel {
    name: String,
    device: Arc<dyn Device>,
    control: Option<ControlChannel>,
}

impl Tunnel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_control_channel(&self) -> bool {
        self.control.is_some()
    }

    /// Close the control channel, then the engine.
    fn shutdown(self) {
        if let Some(control) = self.control {
            control.close();
        }
        self.device.close();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("name", &self.name)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

/// Arguments of [`Backend::turn_on`]
#[derive(Debug, Clone, Copy)]
pub struct TurnOn<'a> {
    /// Used when the descriptor cannot report its interface name
    pub interface_name: &'a str,
    /// Host-owned TUN descriptor; the bridge takes ownership
    pub tun_fd: RawFd,
    /// Explicit MTU, or `None` to query the interface
    pub mtu: Option<u32>,
    /// Initial engine configuration text
    pub settings: &'a str,
}

/// All tunnels of the process.
pub struct Backend {
    config: BridgeConfig,
    factory: Box<dyn DeviceFactory>,
    sink: Arc<dyn LogSink>,
    tunnels: Registry<Tunnel>,
}

impl Backend {
    pub fn new(config: BridgeConfig, factory: Box<dyn DeviceFactory>, sink: Arc<dyn LogSink>) -> Self {
        let tunnels = Registry::new(config.max_handles);
        Self {
            config,
            factory,
            sink,
            tunnels,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn sink(&self) -> Arc<dyn LogSink> {
        Arc::clone(&self.sink)
    }

    /// Start a tunnel over `request.tun_fd`.
    ///
    /// The descriptor belongs to the bridge from here on: it is closed on
    /// failure and by [`Backend::turn_off`] on success.
    pub fn turn_on(&self, request: TurnOn<'_>) -> anyhow::Result<Handle> {
        let logger = Logger::new(Arc::clone(&self.sink), &self.config.log_tag, request.interface_name);

        let result = self.start(request, &logger);
        if let Err(e) = &result {
            logger.error(format_args!("{e:#}"));
        }
        result
    }

    fn start(&self, request: TurnOn<'_>, logger: &Logger) -> anyhow::Result<Handle> {
        let options = TunOptions {
            name: Some(request.interface_name.to_owned()),
            mtu: request.mtu,
            default_mtu: self.config.default_mtu,
        };

        // SAFETY: the host hands the descriptor over with this call.
        let tun = match unsafe { FdTun::from_raw_fd(request.tun_fd, options) } {
            Ok(tun) => tun,
            Err(e) => {
                release_fd(request.tun_fd);
                return Err(e).context("Failed to adapt TUN descriptor");
            }
        };
        let name = tun.interface_name().to_owned();

        logger.info("Attaching to interface");
        let device = self.factory.create(Box::new(tun), logger.clone(), &self.config.engine);

        let mut settings = request.settings.as_bytes();
        if let Err(e) = device.ipc_set_operation(&mut settings) {
            device.close();
            return Err(e).context("Failed to apply configuration");
        }

        let listener = match ControlListener::bind(&self.config.uapi_path(&name)) {
            Ok(listener) => Some(listener),
            Err(e) => {
                logger.error(format_args!("Failed to open control socket: {e}"));
                None
            }
        };

        device.up();
        logger.info("Device started");

        let control = listener.and_then(|listener| {
            match ControlChannel::spawn(listener, Arc::clone(&device), &name) {
                Ok(control) => Some(control),
                Err(e) => {
                    logger.error(format_args!("Failed to start control acceptor: {e}"));
                    None
                }
            }
        });

        let tunnel = Tunnel {
            name: name.clone(),
            device,
            control,
        };

        match self.tunnels.allocate(tunnel) {
            Ok(handle) => {
                info!(handle = handle.get(), iface = %name, "Tunnel started");
                Ok(handle)
            }
            Err(RegistryError::Exhausted { instance, limit }) => {
                instance.shutdown();
                bail!("Unable to find an empty tunnel handle below {limit}");
            }
        }
    }

    /// Stop the tunnel under `handle`. Unknown handles are ignored.
    pub fn turn_off(&self, handle: i32) {
        let Some(tunnel) = Handle::new(handle).and_then(|h| self.tunnels.remove(h)) else {
            debug!(handle, "turn_off on unknown handle");
            return;
        };

        let name = tunnel.name.clone();
        tunnel.shutdown();
        info!(handle, iface = %name, "Tunnel stopped");
    }

    /// Engine socket for `family`, still owned by the engine.
    pub fn socket(&self, handle: i32, family: IpFamily) -> Option<RawFd> {
        let device = self.device(handle)?;
        match device.peek_socket_fd(family) {
            Ok(fd) if fd >= 0 => Some(fd),
            Ok(_) => None,
            Err(e) => {
                debug!(handle, "No {} socket: {}", family, e);
                None
            }
        }
    }

    pub fn socket_v4(&self, handle: i32) -> Option<RawFd> {
        self.socket(handle, IpFamily::V4)
    }

    pub fn socket_v6(&self, handle: i32) -> Option<RawFd> {
        self.socket(handle, IpFamily::V6)
    }

    /// Current engine configuration text.
    pub fn config_text(&self, handle: i32) -> Option<String> {
        let device = self.device(handle)?;
        let mut out = Vec::new();
        if let Err(e) = device.ipc_get_operation(&mut out) {
            debug!(handle, "Config query failed: {}", e);
            return None;
        }
        String::from_utf8(out).ok()
    }

    /// Handles of every live tunnel, ascending
    pub fn live_handles(&self) -> Vec<Handle> {
        self.tunnels.handles()
    }

    /// Whether the tunnel under `handle` got a control channel
    pub fn has_control_channel(&self, handle: i32) -> Option<bool> {
        let handle = Handle::new(handle)?;
        self.tunnels.with(handle, Tunnel::has_control_channel)
    }

    fn device(&self, handle: i32) -> Option<Arc<dyn Device>> {
        let handle = Handle::new(handle)?;
        self.tunnels.with(handle, |t| Arc::clone(&t.device))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("config", &self.config)
            .field("tunnels", &self.tunnels)
            .finish_non_exhaustive()
    }
}

/// Close a host descriptor the bridge could not adopt.
pub(crate) fn release_fd(fd: RawFd) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}
