//! Tunnel client module
//!
//! Owns the tunnel settings, renders the client config and credential files
//! from the selected server record, and drives the [`Supervisor`] retry loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::DataLayout;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::process::{CommandSpec, ProcessHandle};
use crate::servers::{Server, ServerStore};
use crate::store::{update_file, SettingsStore};
use crate::supervisor::{Supervisor, TunnelLaunch};

use super::{decode_settings, Module, ModuleStatus, Params, RouteTable};

/// Module name and settings key
pub const TUNNEL_MODULE: &str = "openvpn";

/// Environment variable telling the hook where the data directory is
pub const DATA_ENV: &str = "TUNGATE_DATA";

const DATA_CIPHERS: &str = "AES-256-GCM:AES-128-GCM:CHACHA20-POLY1305:AES-256-CBC:AES-128-CBC";

/// Persisted tunnel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub server_endpoint: String,
    #[serde(default)]
    pub log_level: u32,
    /// Seconds; also the status and ping-restart interval
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_name: String::new(),
            server_endpoint: String::new(),
            log_level: 0,
            retry_interval: default_retry_interval(),
        }
    }
}

fn default_retry_interval() -> u64 {
    3600
}

/// Files and programs used to launch the tunnel client
#[derive(Debug, Clone)]
pub struct TunnelPaths {
    pub program: String,
    /// Executable invoked by the client's up/down hooks
    pub hook_exe: PathBuf,
    pub data_dir: PathBuf,
    pub var_dir: PathBuf,
    pub config: PathBuf,
    pub auth: PathBuf,
    pub pid_file: PathBuf,
    pub log: PathBuf,
    pub status: PathBuf,
}

impl TunnelPaths {
    pub fn new(layout: &DataLayout, program: impl Into<String>, hook_exe: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            hook_exe: hook_exe.into(),
            data_dir: layout.data_dir.clone(),
            var_dir: layout.var_dir.clone(),
            config: layout.tunnel_config(),
            auth: layout.tunnel_auth(),
            pid_file: layout.tunnel_pid_file(),
            log: layout.tunnel_log(),
            status: layout.tunnel_status(),
        }
    }
}

/// Rendered config and auth file contents
struct Artifacts {
    config: String,
    auth: String,
}

/// Launch parameters shared with the supervisor loop
struct Launcher {
    paths: TunnelPaths,
    settings: RwLock<TunnelSettings>,
    stop_requested: AtomicBool,
}

impl Launcher {
    fn settings(&self) -> TunnelSettings {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, settings: TunnelSettings) {
        match self.settings.write() {
            Ok(mut s) => *s = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}

impl TunnelLaunch for Launcher {
    fn should_run(&self) -> bool {
        self.settings().enabled && !self.stop_requested.load(Ordering::SeqCst)
    }

    fn required_artifacts(&self) -> Vec<PathBuf> {
        vec![self.paths.config.clone(), self.paths.auth.clone()]
    }

    fn command(&self) -> CommandSpec {
        let settings = self.settings();
        let retry = settings.retry_interval.to_string();
        let hook = path(&self.paths.hook_exe);

        let mut args = vec![
            "--client".to_string(),
            "--cd".into(),
            path(&self.paths.var_dir),
            "--config".into(),
            path(&self.paths.config),
            "--auth-user-pass".into(),
            path(&self.paths.auth),
            "--auth-nocache".into(),
            "--verb".into(),
            settings.log_level.to_string(),
            "--log".into(),
            path(&self.paths.log),
            "--status".into(),
            path(&self.paths.status),
            retry.clone(),
            "--ping-restart".into(),
            retry,
            "--connect-retry-max".into(),
            "3".into(),
            "--script-security".into(),
            "2".into(),
            "--up".into(),
            hook.clone(),
            "--up-delay".into(),
            "--down".into(),
            hook,
            "--up-restart".into(),
        ];
        for filtered in ["route-ipv6", "ifconfig-ipv6", "block-outside-dns"] {
            args.extend(["--pull-filter".to_string(), "ignore".into(), filtered.into()]);
        }
        args.extend([
            "--redirect-gateway".to_string(),
            "def1".into(),
            "--remote-cert-tls".into(),
            "server".into(),
            "--data-ciphers".into(),
            DATA_CIPHERS.into(),
        ]);

        CommandSpec::new(&self.paths.program)
            .args(args)
            .current_dir(&self.paths.var_dir)
            .env(DATA_ENV, path(&self.paths.data_dir))
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.settings().retry_interval)
    }
}

/// The tunnel client module
pub struct TunnelModule {
    store: Arc<SettingsStore>,
    servers: Arc<ServerStore>,
    launcher: Arc<Launcher>,
    supervisor: Supervisor,
    lifecycle: tokio::sync::Mutex<()>,
}

impl TunnelModule {
    /// Load stored settings, initializing them if absent
    pub fn new(store: Arc<SettingsStore>, servers: Arc<ServerStore>, paths: TunnelPaths) -> Result<Self> {
        let settings = store.load_or_init(TUNNEL_MODULE, TunnelSettings::default())?;
        let process = Arc::new(ProcessHandle::new(TUNNEL_MODULE).with_pid_file(&paths.pid_file));
        let launcher = Arc::new(Launcher {
            paths,
            settings: RwLock::new(settings),
            stop_requested: AtomicBool::new(false),
        });
        let supervisor = Supervisor::new(launcher.clone(), process);
        Ok(Self {
            store,
            servers,
            launcher,
            supervisor,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn current(&self) -> TunnelSettings {
        self.launcher.settings()
    }

    pub fn process(&self) -> &Arc<ProcessHandle> {
        self.supervisor.process()
    }

    /// Command line the supervisor runs with the current settings
    pub fn command(&self) -> CommandSpec {
        self.launcher.command()
    }

    pub fn servers(&self) -> &Arc<ServerStore> {
        &self.servers
    }

    fn persist(&self, settings: TunnelSettings) -> Result<()> {
        self.store.put(TUNNEL_MODULE, &settings)?;
        self.launcher.replace(settings);
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        let mut settings = self.current();
        if settings.enabled != enabled {
            settings.enabled = enabled;
            self.persist(settings)?;
        }
        Ok(())
    }

    /// Render the artifacts for `settings` without writing anything
    fn render(&self, settings: &TunnelSettings) -> Result<Option<Artifacts>> {
        if settings.server_name.is_empty() {
            return Ok(None);
        }
        let server: Server = self.servers.get(&settings.server_name)?;
        Ok(Some(Artifacts {
            config: server.render_config(&settings.server_endpoint)?,
            auth: server.auth_file(),
        }))
    }

    /// Returns whether either file changed
    fn write(&self, artifacts: &Artifacts) -> Result<bool> {
        let paths = &self.launcher.paths;
        let config = update_file(&paths.config, &artifacts.config, Some(0o644))?;
        let auth = update_file(&paths.auth, &artifacts.auth, Some(0o600))?;
        Ok(config || auth)
    }

    fn start_locked(&self) -> Result<()> {
        self.set_enabled(true)?;
        self.launcher.stop_requested.store(false, Ordering::SeqCst);
        self.supervisor.start();
        Ok(())
    }

    fn stop_locked(&self) -> Result<()> {
        self.launcher.stop_requested.store(true, Ordering::SeqCst);
        self.supervisor.stop()?;
        Ok(())
    }

    fn restart_locked(&self) -> Result<()> {
        self.set_enabled(true)?;
        self.launcher.stop_requested.store(false, Ordering::SeqCst);
        self.supervisor.restart()
    }

    /// Re-render the artifacts after a server record changed
    ///
    /// Restarts the tunnel when the selected server's files changed.
    pub async fn refresh_artifacts(&self, server: &str) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        let settings = self.current();
        if settings.server_name != server {
            return Ok(false);
        }
        let Some(artifacts) = self.render(&settings)? else {
            return Ok(false);
        };
        let changed = self.write(&artifacts)?;
        if changed && settings.enabled && self.supervisor.is_active() {
            log::info!("Server {} changed, restarting tunnel", server);
            self.supervisor.restart()?;
        }
        Ok(changed)
    }
}

#[async_trait]
impl Module for TunnelModule {
    fn name(&self) -> &str {
        TUNNEL_MODULE
    }

    fn is_enabled(&self) -> bool {
        self.current().enabled
    }

    fn autostart(&self) -> bool {
        true
    }

    fn register_routes(self: Arc<Self>, routes: &mut RouteTable) {
        let servers = self.servers.clone();
        routes.add(TUNNEL_MODULE, "servers/list", move |_| {
            let servers = servers.clone();
            async move { Ok::<_, Error>(serde_json::to_value(servers.list())?) }
        });

        let servers = self.servers.clone();
        routes.add(TUNNEL_MODULE, "servers/get", move |body| {
            let servers = servers.clone();
            async move {
                let server = servers.get(&server_name(&body))?;
                Ok::<_, Error>(serde_json::to_value(server)?)
            }
        });

        let module = self.clone();
        routes.add(TUNNEL_MODULE, "servers/save", move |body| {
            let module = module.clone();
            async move {
                let server: Server = decode_settings("server", body)?;
                let saved = module.servers.save(server)?;
                module.refresh_artifacts(&saved.name).await?;
                Ok::<_, Error>(serde_json::to_value(saved)?)
            }
        });

        let servers = self.servers.clone();
        routes.add(TUNNEL_MODULE, "servers/delete", move |body| {
            let servers = servers.clone();
            async move {
                servers.delete(&server_name(&body))?;
                Ok::<_, Error>(Value::Null)
            }
        });
    }

    async fn status(&self) -> Result<ModuleStatus> {
        let settings = self.current();
        let process = self.process();
        let mut info = serde_json::Map::new();
        info.insert("enabled".into(), json!(settings.enabled));
        info.insert("serverName".into(), json!(settings.server_name));
        info.insert("serverEndpoint".into(), json!(settings.server_endpoint));
        info.insert("supervising".into(), json!(self.supervisor.is_active()));
        Ok(ModuleStatus {
            running: process.is_running(),
            pid: process.pid(),
            info,
        })
    }

    async fn enable(&self, start_now: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.set_enabled(true)?;
        if start_now {
            self.start_locked()?;
        }
        Ok(())
    }

    async fn disable(&self, stop_now: bool) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.set_enabled(false)?;
        if stop_now {
            self.stop_locked()?;
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked()
    }

    async fn stop(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked()
    }

    async fn restart(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.restart_locked()
    }

    async fn settings(&self, _params: &Params) -> Result<Value> {
        Ok(serde_json::to_value(self.current())?)
    }

    async fn save_settings(&self, _params: &Params, settings: Value) -> Result<bool> {
        let new: TunnelSettings = decode_settings(TUNNEL_MODULE, settings)?;
        let _guard = self.lifecycle.lock().await;
        if new == self.current() {
            return Ok(false);
        }

        let artifacts = self.render(&new)?;
        self.persist(new.clone())?;
        if let Some(ref artifacts) = artifacts {
            self.write(artifacts)?;
        }
        log::info!("Tunnel settings saved");

        if new.enabled {
            self.restart_locked()?;
        } else {
            self.stop_locked()?;
        }
        Ok(true)
    }

    async fn handle_event(&self, event: &Event) {
        if event.kind == EventKind::Shutdown {
            if let Err(e) = self.stop().await {
                log::warn!("Failed to stop tunnel: {}", e);
            }
        }
    }
}

fn path(p: &Path) -> String {
    p.display().to_string()
}

fn server_name(body: &Value) -> String {
    match body {
        Value::String(name) => name.clone(),
        other => other
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}
