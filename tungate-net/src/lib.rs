//! Host network primitives for the tungate gateway
//!
//! This crate owns the three pieces of host state a tunnel edge touches:
//!
//! - **Default route**: replaced through `ip route` ([`route`])
//! - **Inbound firewall**: the `INPUT` chain, replaced wholesale through
//!   `iptables` ([`firewall`])
//! - **Resolver file**: `/etc/resolv.conf` with a one-shot backup ([`resolv`])
//!
//! All external commands go through a [`CommandRunner`], so callers can swap
//! in a [`RecordingRunner`] and assert on the exact command sequence.
//!
//! # Platform Requirements
//!
//! Linux with `iproute2` and `iptables` installed. Applying changes requires
//! root or `CAP_NET_ADMIN`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tungate_net::{Firewall, FirewallPolicy, Route, RouteManager, SystemRunner};
//!
//! let runner = Arc::new(SystemRunner);
//! RouteManager::new(runner.clone())
//!     .replace_default(&Route::default_via_str("10.8.0.1")?.with_interface("tun0"))
//!     .await?;
//! Firewall::new(runner).replace(&FirewallPolicy::tunnel_up("tun0")).await?;
//! ```

pub mod command;
pub mod error;
pub mod firewall;
pub mod resolv;
pub mod route;

pub use command::{CommandRunner, RecordingRunner, SystemRunner};
pub use error::{Error, Result};
pub use firewall::{Firewall, FirewallPolicy, FirewallRule, Verdict};
pub use resolv::{first_nameserver, ResolvConf, ResolverFile};
pub use route::{parse_default_gateway, Route, RouteManager};
