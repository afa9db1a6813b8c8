//! Settings shared by every module

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::Event;
use crate::store::{update_file, SettingsStore};

/// Settings store key of the global settings
pub const GLOBAL_KEY: &str = "global";

/// Gateway-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default = "default_vpn_types")]
    pub vpn_types: Vec<String>,
    #[serde(default = "default_vpn_type")]
    pub vpn_type: String,
    /// Local subnets routed around the tunnel by external scripts
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub proxy_username: String,
    #[serde(default)]
    pub proxy_password: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            vpn_types: default_vpn_types(),
            vpn_type: default_vpn_type(),
            subnets: Vec::new(),
            proxy_username: String::new(),
            proxy_password: String::new(),
        }
    }
}

impl GlobalSettings {
    /// Proxy credentials, if both parts are set
    pub fn proxy_credentials(&self) -> Option<(&str, &str)> {
        if self.proxy_username.is_empty() || self.proxy_password.is_empty() {
            None
        } else {
            Some((&self.proxy_username, &self.proxy_password))
        }
    }
}

fn default_vpn_types() -> Vec<String> {
    vec!["openvpn".to_string(), "wireguard".to_string()]
}

fn default_vpn_type() -> String {
    "openvpn".to_string()
}

/// Current global settings, persisted and broadcast on change
pub struct GlobalState {
    store: Arc<SettingsStore>,
    bus: Arc<EventBus>,
    env_file: PathBuf,
    current: RwLock<GlobalSettings>,
    default_gateway: RwLock<Option<Ipv4Addr>>,
    save_lock: tokio::sync::Mutex<()>,
}

impl GlobalState {
    /// Load the stored settings, initializing them with defaults if absent
    pub fn load(
        store: Arc<SettingsStore>,
        bus: Arc<EventBus>,
        env_file: impl Into<PathBuf>,
    ) -> Result<Self> {
        let current = store.load_or_init(GLOBAL_KEY, GlobalSettings::default())?;
        Ok(Self {
            store,
            bus,
            env_file: env_file.into(),
            current: RwLock::new(current),
            default_gateway: RwLock::new(None),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self) -> GlobalSettings {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Host gateway discovered at start-up
    pub fn default_gateway(&self) -> Option<Ipv4Addr> {
        match self.default_gateway.read() {
            Ok(gw) => *gw,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_default_gateway(&self, gateway: Option<Ipv4Addr>) {
        match self.default_gateway.write() {
            Ok(mut gw) => *gw = gateway,
            Err(poisoned) => *poisoned.into_inner() = gateway,
        }
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Persist `settings` and announce the change
    ///
    /// Returns `false` without writing anything when `settings` equals the
    /// current value.
    pub async fn save(&self, settings: GlobalSettings) -> Result<bool> {
        let _guard = self.save_lock.lock().await;
        if settings == self.get() {
            return Ok(false);
        }

        self.store.put(GLOBAL_KEY, &settings)?;
        match self.current.write() {
            Ok(mut current) => *current = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }

        if let Err(e) = self.write_env() {
            log::warn!("Failed to update {:?}: {}", self.env_file, e);
        }

        log::info!("Global settings changed");
        let _ = self.bus.publish(Event::settings_changed(settings));
        Ok(true)
    }

    /// Rewrite the env file read by external scripts
    pub fn write_env(&self) -> Result<()> {
        let settings = self.get();
        let mut env = format!("SUBNETS={}\n", settings.subnets.join(","));
        if let Some(gateway) = self.default_gateway() {
            env.push_str(&format!("DEFAULT_GATEWAY={}\n", gateway));
        }
        update_file(&self.env_file, &env, Some(0o644))?;
        Ok(())
    }
}
