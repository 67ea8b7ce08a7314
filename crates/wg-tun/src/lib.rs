//! wg-tun - TUN devices over host-owned descriptors
//!
//! Adapts a file descriptor handed over by the Android `VpnService` into a
//! network interface a tunnel engine can read and write from its own threads,
//! and that teardown can interrupt without yanking the descriptor away.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               Tunnel engine                   │
//! │        read / write / events / close          │
//! └──────────────────────┬───────────────────────┘
//!                        │ dyn Tun
//!           ┌────────────┴────────────┐
//!           ▼                         ▼
//!   ┌───────────────┐         ┌───────────────┐
//!   │    FdTun      │         │  ChannelTun   │
//!   │ name, mtu,    │         │  in-memory    │
//!   │ event queues  │         │  loopback     │
//!   └───────┬───────┘         └───────────────┘
//!           │
//!   ┌───────▼───────┐
//!   │   RwCancel    │  poll(fd, cancel pipe)
//!   └───────┬───────┘
//!           ▼
//!     host descriptor
//! ```

pub mod rwcancel;
pub mod tun;

pub use rwcancel::{CancelError, RwCancel};
pub use tun::{ChannelTun, FdTun, Tun, TunError, TunEvent, TunOptions};
