//! Core of the vpnd daemon.
//!
//! One connection manager task owns the tunnel lifecycle and drives the
//! platform components on its behalf:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  frontends ──► ipc ──► manager ◄── netchange / wifi / backend   │
//! ├────────────────────────────────────────────────────────────────┤
//! │  backend (WireGuard, OpenVPN)   v2ray   dns   firewall         │
//! │  splittun   route   netinfo                                    │
//! ├────────────────────────────────────────────────────────────────┤
//! │  preferences   servers   eaa   lock                            │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod dns;
pub mod eaa;
pub mod error;
pub mod firewall;
pub mod ipc;
pub mod lock;
pub mod manager;
pub mod netchange;
pub mod netinfo;
pub mod ping;
pub mod port;
pub mod preferences;
pub mod route;
pub mod servers;
pub mod splittun;
pub mod types;
pub mod v2ray;
pub mod wifi;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorKind, VpnError, VpnResult};
pub use lock::DaemonLock;
pub use manager::{DaemonEvent, ManagerDeps, ManagerHandle};
pub use types::{ConnectionRequest, ConnectionState, StateInfo, VpnType};
