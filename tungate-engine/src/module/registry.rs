//! Name → module lookup
//!
//! Written during start-up, read concurrently afterwards.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::event::EventKind;

use super::{Module, ModuleEvents, RouteTable};

const EVENT_KINDS: [EventKind; 4] = [
    EventKind::VpnUp,
    EventKind::VpnDown,
    EventKind::GlobalSettingsChanged,
    EventKind::Shutdown,
];

#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<BTreeMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module; names are unique
    pub fn register(&self, module: Arc<dyn Module>) -> Result<()> {
        let mut modules = match self.modules.write() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        let name = module.name().to_string();
        if modules.contains_key(&name) {
            return Err(Error::AlreadyRegistered(name));
        }
        log::debug!("Registered module {}", name);
        modules.insert(name, module);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn Module>> {
        self.read().values().cloned().collect()
    }

    /// Subscribe every module to every event kind
    pub fn subscribe_all(&self, bus: &EventBus) {
        for module in self.all() {
            for kind in EVENT_KINDS {
                bus.subscribe(kind, Arc::new(ModuleEvents(module.clone())));
            }
        }
    }

    /// Collect the management routes of every module
    pub fn routes(&self) -> RouteTable {
        let mut routes = RouteTable::new();
        for module in self.all() {
            module.register_routes(&mut routes);
        }
        routes
    }

    /// Start every enabled module marked for autostart
    pub async fn autostart(&self) {
        for module in self.all() {
            if module.autostart() && module.is_enabled() {
                log::info!("Autostarting {}", module.name());
                if let Err(e) = module.start().await {
                    log::error!("Failed to start {}: {}", module.name(), e);
                }
            }
        }
    }

    /// Ask every module to stop; failures are logged
    pub async fn stop_all(&self) {
        for module in self.all() {
            if let Err(e) = module.stop().await {
                log::warn!("Failed to stop {}: {}", module.name(), e);
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<dyn Module>>> {
        match self.modules.read() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
