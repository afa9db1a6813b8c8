//! Managed modules
//!
//! A module wraps one external service behind a uniform lifecycle:
//!
//! ```text
//!              enable(false)                start()
//!  Disabled ───────────────▶ Enabled-Stopped ─────▶ Enabled-Running
//!     ▲                         ▲    │  ▲               │
//!     │        disable(_)       │    │  └── stop() ─────┘
//!     └─────────────────────────┴────┘
//! ```
//!
//! Starting a disabled module enables it first; there is no disabled state
//! with a running process.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventListener;
use crate::error::{Error, Result};
use crate::event::Event;

pub mod proxy;
pub mod registry;
pub mod tunnel;

pub use proxy::{ProxyKind, ProxyModule, ProxySettings};
pub use registry::ModuleRegistry;
pub use tunnel::{TunnelModule, TunnelPaths, TunnelSettings};

/// Request parameters passed to settings operations
pub type Params = BTreeMap<String, String>;

/// Snapshot reported by [`Module::status`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default)]
    pub info: serde_json::Map<String, Value>,
}

/// A managed service with a uniform lifecycle
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable name; also the settings store key
    fn name(&self) -> &str;

    /// Whether the persisted settings have the module enabled
    fn is_enabled(&self) -> bool;

    /// Whether the daemon starts this module at start-up when enabled
    fn autostart(&self) -> bool {
        false
    }

    /// Add module-specific management routes
    fn register_routes(self: Arc<Self>, _routes: &mut RouteTable) {}

    async fn status(&self) -> Result<ModuleStatus>;

    /// Persist enabled=true, then start if `start_now`
    async fn enable(&self, start_now: bool) -> Result<()>;

    /// Persist enabled=false, then stop if `stop_now`
    async fn disable(&self, stop_now: bool) -> Result<()>;

    /// Start the process; a no-op if it is already running
    async fn start(&self) -> Result<()>;

    /// Send SIGTERM to the process; never force-kills
    async fn stop(&self) -> Result<()>;

    async fn restart(&self) -> Result<()>;

    async fn settings(&self, params: &Params) -> Result<Value>;

    /// Replace the settings
    ///
    /// Returns `false` without any I/O when `settings` equals the current
    /// value.
    async fn save_settings(&self, params: &Params, settings: Value) -> Result<bool>;

    async fn handle_event(&self, event: &Event);
}

/// Delivers bus events to a module
pub struct ModuleEvents(pub Arc<dyn Module>);

#[async_trait]
impl EventListener for ModuleEvents {
    async fn handle_event(&self, event: &Event) {
        self.0.handle_event(event).await;
    }
}

/// Decode a settings object, naming the module in the error
pub(crate) fn decode_settings<T: serde::de::DeserializeOwned>(module: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::InvalidRequest(format!("invalid {} settings: {}", module, e)))
}

type RouteHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Module-specific management routes, keyed by `module/route`
#[derive(Default, Clone)]
pub struct RouteTable {
    routes: BTreeMap<String, RouteHandler>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `module`/`route`; a later registration replaces it
    pub fn add<F, Fut>(&mut self, module: &str, route: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |body| Box::pin(handler(body)));
        self.routes.insert(format!("{}/{}", module, route), handler);
    }

    /// Registered route keys
    pub fn keys(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    /// Invoke a route
    pub async fn call(&self, module: &str, route: &str, body: Value) -> Result<Value> {
        let key = format!("{}/{}", module, route);
        let handler = self
            .routes
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("no route {}", key)))?;
        handler(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_table_dispatch() {
        let mut routes = RouteTable::new();
        routes.add("openvpn", "echo", |body| async move { Ok::<_, Error>(body) });

        let out = routes
            .call("openvpn", "echo", serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!({"a": 1}));
        assert_eq!(routes.keys(), vec!["openvpn/echo"]);

        let err = routes.call("openvpn", "missing", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_status_serialization() {
        let status = ModuleStatus {
            running: true,
            pid: Some(42),
            info: serde_json::Map::new(),
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["running"], true);
        assert_eq!(value["pid"], 42);
        assert!(serde_json::to_value(ModuleStatus::default())
            .unwrap()
            .get("pid")
            .is_none());
    }
}
