//! HTTP and SOCKS proxy modules
//!
//! Both proxies follow the tunnel: they start on `vpn-up` when enabled, stop
//! on `vpn-down` and shutdown, and pick up new proxy credentials by
//! regenerating their config and restarting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{DataLayout, ProxySection};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::global::{GlobalSettings, GlobalState};
use crate::process::{CommandSpec, ProcessHandle};
use crate::store::{update_file, SettingsStore};

use super::{decode_settings, Module, ModuleStatus, Params};

const HTTP_TEMPLATE: &str = "\
Port {{port}}
Listen 0.0.0.0
Timeout 600
MaxClients 100
LogLevel Info
DisableViaHeader Yes
";

const SOCKS_TEMPLATE: &str = "\
logoutput: stderr
internal: 0.0.0.0 port = {{port}}
external: tun0
clientmethod: none
socksmethod: none
user.privileged: root
user.unprivileged: nobody
client pass {
    from: 0.0.0.0/0 to: 0.0.0.0/0
}
socks pass {
    from: 0.0.0.0/0 to: 0.0.0.0/0
}
";

/// Which proxy a [`ProxyModule`] runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks,
}

impl ProxyKind {
    /// Module name and settings key
    pub fn name(&self) -> &'static str {
        match self {
            ProxyKind::Http => "http_proxy",
            ProxyKind::Socks => "socks_proxy",
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            ProxyKind::Http => HTTP_TEMPLATE,
            ProxyKind::Socks => SOCKS_TEMPLATE,
        }
    }

    /// Fill in `template` for `port`, enabling authentication when the
    /// global settings carry proxy credentials
    pub fn render(&self, template: &str, port: u16, global: &GlobalSettings) -> String {
        let mut config = template.replace("{{port}}", &port.to_string());
        if let Some((username, password)) = global.proxy_credentials() {
            match self {
                ProxyKind::Http => {
                    if !config.ends_with('\n') && !config.is_empty() {
                        config.push('\n');
                    }
                    config.push_str(&format!("BasicAuth {} {}\n", username, password));
                }
                ProxyKind::Socks => {
                    config = config.replacen("socksmethod: none", "socksmethod: username", 1);
                }
            }
        }
        config
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
}

/// A proxy daemon tied to the tunnel
pub struct ProxyModule {
    kind: ProxyKind,
    section: ProxySection,
    config_path: PathBuf,
    store: Arc<SettingsStore>,
    global: Arc<GlobalState>,
    settings: RwLock<ProxySettings>,
    process: Arc<ProcessHandle>,
    /// A restart is waiting for the old child to exit
    restart_pending: Arc<AtomicBool>,
    lifecycle: Arc<tokio::sync::Mutex<()>>,
}

impl ProxyModule {
    pub fn new(
        kind: ProxyKind,
        section: ProxySection,
        layout: &DataLayout,
        store: Arc<SettingsStore>,
        global: Arc<GlobalState>,
    ) -> Result<Self> {
        let settings = store.load_or_init(kind.name(), ProxySettings::default())?;
        let process =
            ProcessHandle::new(kind.name()).with_pid_file(layout.proxy_pid_file(kind.name()));
        Ok(Self {
            kind,
            section,
            config_path: layout.proxy_config(kind.name()),
            store,
            global,
            settings: RwLock::new(settings),
            process: Arc::new(process),
            restart_pending: Arc::new(AtomicBool::new(false)),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn current(&self) -> ProxySettings {
        match self.settings.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn process(&self) -> &Arc<ProcessHandle> {
        &self.process
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Command line with `{config}` substituted
    pub fn command(&self) -> CommandSpec {
        let config = self.config_path.display().to_string();
        CommandSpec::new(&self.section.program).args(
            self.section
                .args
                .iter()
                .map(|arg| arg.replace("{config}", &config)),
        )
    }

    /// Rewrite the generated config; returns whether it changed
    pub fn write_config(&self) -> Result<bool> {
        let template = match self.section.template {
            Some(ref path) => std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("{} template {:?}: {}", self.kind, path, e))
            })?,
            None => self.kind.default_template().to_string(),
        };
        let config = self.kind.render(&template, self.section.port, &self.global.get());
        update_file(&self.config_path, &config, Some(0o644))
    }

    fn persist(&self, settings: ProxySettings) -> Result<()> {
        self.store.put(self.kind.name(), &settings)?;
        match self.settings.write() {
            Ok(mut s) => *s = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) -> Result<()> {
        if self.current().enabled != enabled {
            self.persist(ProxySettings { enabled })?;
        }
        Ok(())
    }

    fn start_locked(&self) -> Result<()> {
        self.set_enabled(true)?;
        if self.process.is_running() {
            return Ok(());
        }
        self.write_config()?;
        self.process.start_detached(&self.command())?;
        Ok(())
    }

    fn stop_locked(&self) -> Result<()> {
        self.restart_pending.store(false, Ordering::SeqCst);
        self.process.signal(Signal::SIGTERM)?;
        Ok(())
    }

    /// Terminate the running child and start a new one once it has exited
    ///
    /// Returns without waiting: the new child is started from a background
    /// task that takes the lifecycle lock after the exit. A stop issued in
    /// between cancels it.
    fn restart_locked(&self) -> Result<()> {
        if !self.process.is_running() {
            return self.start_locked();
        }
        self.set_enabled(true)?;
        self.write_config()?;
        if !self.process.signal(Signal::SIGTERM)? {
            return self.start_locked();
        }
        if self.restart_pending.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let kind = self.kind;
        let command = self.command();
        let process = self.process.clone();
        let pending = self.restart_pending.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            process.wait_until_absent().await;
            let _guard = lifecycle.lock().await;
            if !pending.swap(false, Ordering::SeqCst) {
                log::debug!("Pending restart of {} was cancelled", kind);
                return;
            }
            match process.start_detached(&command) {
                Ok(_) => log::info!("{} restarted", kind),
                Err(e) => log::error!("Failed to restart {}: {}", kind, e),
            }
        });
        Ok(())
    }

    async fn on_event(&self, event: &Event) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match event.kind {
            EventKind::VpnUp if self.current().enabled => self.start_locked(),
            EventKind::VpnUp => Ok(()),
            EventKind::VpnDown | EventKind::Shutdown => self.stop_locked(),
            EventKind::GlobalSettingsChanged => {
                let changed = self.write_config()?;
                if changed && self.process.is_running() {
                    log::info!("{} config changed, restarting", self.kind);
                    self.restart_locked()?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Module for ProxyModule {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn is_enabled(&self) -> bool {
        self.current().enabled
    }

    async fn status(&self) -> Result<ModuleStatus> {
        let mut info = serde_json::Map::new();
        info.insert("enabled".into(), json!(self.current().enabled));
        info.insert("port".into(), json!(self.section.port));
        Ok(ModuleStatus {
            running: self.process.is_running(),
            pid: self.process.pid(),
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
        let new: ProxySettings = decode_settings(self.kind.name(), settings)?;
        let _guard = self.lifecycle.lock().await;
        if new == self.current() {
            return Ok(false);
        }
        let enabled = new.enabled;
        self.persist(new)?;
        if !enabled {
            self.stop_locked()?;
        }
        Ok(true)
    }

    async fn handle_event(&self, event: &Event) {
        if let Err(e) = self.on_event(event).await {
            log::error!("{} failed to handle {}: {}", self.kind, event.kind, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::process::ProcessState;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        layout: DataLayout,
        store: Arc<SettingsStore>,
        global: Arc<GlobalState>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.create_dirs().unwrap();
        let store = Arc::new(SettingsStore::open(layout.settings_file()).unwrap());
        let global = Arc::new(
            GlobalState::load(store.clone(), Arc::new(EventBus::new()), layout.env_file()).unwrap(),
        );
        Fixture {
            dir,
            layout,
            store,
            global,
        }
    }

    fn sleeper(port: u16) -> ProxySection {
        ProxySection {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "exec sleep 30".into(), "{config}".into()],
            template: None,
            port,
        }
    }

    fn stubborn(port: u16) -> ProxySection {
        ProxySection {
            program: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                "trap '' TERM; while :; do sleep 1; done".into(),
                "{config}".into(),
            ],
            template: None,
            port,
        }
    }

    fn credentials() -> GlobalSettings {
        GlobalSettings {
            proxy_username: "bob".into(),
            proxy_password: "hunter2".into(),
            ..Default::default()
        }
    }

    async fn wait_absent(module: &ProxyModule) {
        tokio::time::timeout(Duration::from_secs(5), module.process().wait_until_absent())
            .await
            .unwrap();
    }

    #[test]
    fn test_socks_render_switches_method_once() {
        let template = "socksmethod: none\nclientmethod: none\nsocksmethod: none\n";
        let plain = ProxyKind::Socks.render(template, 1080, &GlobalSettings::default());
        assert_eq!(plain, template);

        let auth = ProxyKind::Socks.render(template, 1080, &credentials());
        assert_eq!(
            auth,
            "socksmethod: username\nclientmethod: none\nsocksmethod: none\n"
        );
    }

    #[test]
    fn test_http_render_adds_basic_auth() {
        let config = ProxyKind::Http.render(HTTP_TEMPLATE, 3128, &credentials());
        assert!(config.starts_with("Port 3128\n"));
        assert!(config.ends_with("BasicAuth bob hunter2\n"));
        assert!(!ProxyKind::Http
            .render(HTTP_TEMPLATE, 3128, &GlobalSettings::default())
            .contains("BasicAuth"));
    }

    #[test]
    fn test_command_substitutes_config_path() {
        let f = fixture();
        let module = ProxyModule::new(
            ProxyKind::Http,
            ProxySection::http(),
            &f.layout,
            f.store.clone(),
            f.global.clone(),
        )
        .unwrap();
        let command = module.command();
        assert_eq!(command.program, "/usr/bin/tinyproxy");
        assert_eq!(
            command.args,
            vec![
                "-d".to_string(),
                "-c".to_string(),
                f.layout.proxy_config("http_proxy").display().to_string()
            ]
        );
    }

    #[test]
    fn test_custom_template_file() {
        let f = fixture();
        let template = f.dir.path().join("sockd.conf");
        std::fs::write(&template, "port={{port}}\nsocksmethod: none\n").unwrap();
        let mut section = ProxySection::socks();
        section.template = Some(template);
        let module =
            ProxyModule::new(ProxyKind::Socks, section, &f.layout, f.store.clone(), f.global.clone())
                .unwrap();

        assert!(module.write_config().unwrap());
        assert!(!module.write_config().unwrap());
        assert_eq!(
            std::fs::read_to_string(module.config_path()).unwrap(),
            "port=1080\nsocksmethod: none\n"
        );
    }

    #[test]
    fn test_missing_template_is_config_error() {
        let f = fixture();
        let mut section = ProxySection::socks();
        section.template = Some(f.dir.path().join("absent.conf"));
        let module =
            ProxyModule::new(ProxyKind::Socks, section, &f.layout, f.store.clone(), f.global.clone())
                .unwrap();
        assert!(module.write_config().unwrap_err().is_config_error());
    }

    #[tokio::test]
    async fn test_follows_tunnel_events() {
        let f = fixture();
        let module =
            ProxyModule::new(ProxyKind::Http, sleeper(8888), &f.layout, f.store.clone(), f.global.clone())
                .unwrap();

        module.handle_event(&Event::vpn_up(None)).await;
        assert!(!module.process().is_running());

        module.enable(false).await.unwrap();
        module.handle_event(&Event::vpn_up(None)).await;
        assert!(module.process().is_running());
        assert!(f.layout.proxy_pid_file("http_proxy").exists());

        module.handle_event(&Event::new(EventKind::VpnDown)).await;
        wait_absent(&module).await;
        assert!(module.is_enabled());
    }

    #[tokio::test]
    async fn test_settings_change_restarts_running_proxy() {
        let f = fixture();
        let module =
            ProxyModule::new(ProxyKind::Socks, sleeper(1080), &f.layout, f.store.clone(), f.global.clone())
                .unwrap();
        module.start().await.unwrap();
        let first = module.process().pid().unwrap();

        f.global.save(credentials()).await.unwrap();
        module
            .handle_event(&Event::settings_changed(credentials()))
            .await;

        let mut state = module.process().subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, ProcessState::Running { pid } if *pid != first)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(std::fs::read_to_string(module.config_path())
            .unwrap()
            .contains("socksmethod: username"));

        module.stop().await.unwrap();
        wait_absent(&module).await;
    }

    #[tokio::test]
    async fn test_restart_of_stubborn_child_does_not_block() {
        let f = fixture();
        let module =
            ProxyModule::new(ProxyKind::Http, stubborn(8888), &f.layout, f.store.clone(), f.global.clone())
                .unwrap();
        module.start().await.unwrap();
        let pid = module.process().pid().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let quick = Duration::from_secs(2);
        tokio::time::timeout(quick, module.restart())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(quick, module.stop())
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(quick, module.handle_event(&Event::new(EventKind::Shutdown)))
            .await
            .unwrap();
        assert_eq!(module.process().pid(), Some(pid));

        // The stop cancelled the pending restart
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        wait_absent(&module).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!module.process().is_running());
    }

    #[tokio::test]
    async fn test_restart_without_child_starts() {
        let f = fixture();
        let module =
            ProxyModule::new(ProxyKind::Socks, sleeper(1080), &f.layout, f.store.clone(), f.global.clone())
                .unwrap();
        module.restart().await.unwrap();
        assert!(module.process().is_running());
        assert!(module.is_enabled());

        module.stop().await.unwrap();
        wait_absent(&module).await;
    }

    #[tokio::test]
    async fn test_save_settings_idempotent() {
        let f = fixture();
        let module =
            ProxyModule::new(ProxyKind::Http, sleeper(8888), &f.layout, f.store.clone(), f.global.clone())
                .unwrap();
        let writes = f.store.writes();
        assert!(!module
            .save_settings(&Params::new(), json!({"enabled": false}))
            .await
            .unwrap());
        assert_eq!(f.store.writes(), writes);

        assert!(module
            .save_settings(&Params::new(), json!({"enabled": true}))
            .await
            .unwrap());
        assert_eq!(f.store.writes(), writes + 1);
        assert!(!module.process().is_running());
    }
}
