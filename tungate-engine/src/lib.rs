//! Tungate Engine
//!
//! Lifecycle and coordination core of the tungate gateway daemon: managed
//! modules (the tunnel client and two proxies), the tunnel supervisor, the
//! event bus fed by process signals, and the network transitions applied when
//! the tunnel comes up or goes down.
//!
//! # Architecture
//!
//! ```text
//!  tunnel client hook ──SIGUSR1/2──▶ SignalBridge ──┐
//!  SIGTERM/SIGINT ─────────────────▶                │
//!  control socket (shutdown) ───────────────────────┤
//!                                                   ▼
//!                                               EventBus
//!                     ┌────────────────────────┬────┴─────────────┐
//!                     ▼                        ▼                  ▼
//!          NetworkTransitionManager      TunnelModule        ProxyModule ×2
//!          (resolver, route, firewall)   └─ Supervisor       └─ ProcessHandle
//!                     │                     └─ ProcessHandle
//!                     ▼
//!                tungate-net
//! ```

pub mod bus;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod event;
pub mod global;
pub mod hook;
pub mod module;
pub mod netstate;
pub mod process;
pub mod script;
pub mod servers;
pub mod signal;
pub mod store;
pub mod supervisor;

pub use bus::{Delivery, EventBus, EventListener};
pub use config::{DaemonConfig, DataLayout, ProxySection};
pub use control::{ControlClient, ControlContext, ControlRequest, ControlResponse, ControlServer};
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use event::{Event, EventKind, NetSpec, ScriptType};
pub use global::{GlobalSettings, GlobalState};
pub use hook::hand_off;
pub use module::{
    Module, ModuleRegistry, ModuleStatus, Params, ProxyKind, ProxyModule, RouteTable,
    TunnelModule, TunnelPaths, TunnelSettings,
};
pub use netstate::NetworkTransitionManager;
pub use process::{CommandSpec, ProcessHandle, ProcessState};
pub use servers::{Server, ServerStore};
pub use signal::{read_pid, signal_running, write_pid, SignalBridge};
pub use store::SettingsStore;
pub use supervisor::{Supervisor, TunnelLaunch};
