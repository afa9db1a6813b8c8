//! Daemon assembly and main loop

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::broadcast;
use tungate_net::{CommandRunner, ResolverFile, RouteManager, SystemRunner};

use crate::bus::{EventBus, EventListener};
use crate::config::{DaemonConfig, DataLayout};
use crate::control::{ControlContext, ControlServer};
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::global::GlobalState;
use crate::module::{ModuleRegistry, ProxyKind, ProxyModule, TunnelModule, TunnelPaths};
use crate::netstate::NetworkTransitionManager;
use crate::script::run_setup_once;
use crate::servers::ServerStore;
use crate::signal::{signal_running, write_pid, SignalBridge};
use crate::store::SettingsStore;

/// Turns the `shutdown` event into a wake-up of the main loop
struct ShutdownForwarder(broadcast::Sender<()>);

#[async_trait]
impl EventListener for ShutdownForwarder {
    async fn handle_event(&self, _event: &Event) {
        let _ = self.0.send(());
    }
}

/// The gateway daemon
pub struct Daemon {
    config: DaemonConfig,
    layout: DataLayout,
    runner: Arc<dyn CommandRunner>,
    hook_exe: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        let layout = config.layout();
        let hook_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("tungate"));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            layout,
            runner: Arc::new(SystemRunner),
            hook_exe,
            shutdown_tx,
        }
    }

    /// Run host commands through `runner` instead of the system
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Executable the tunnel client invokes as its up/down hook
    pub fn with_hook_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.hook_exe = exe.into();
        self
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Handle that stops [`Self::run`] from outside
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until a `shutdown` event
    ///
    /// Returns `Ok(())` without doing anything if another daemon already
    /// answers on this data directory's pid file. Failure to create the data
    /// directories is the only fatal start-up error besides failing to open
    /// the stores.
    pub async fn run(self) -> Result<()> {
        self.layout.create_dirs()?;

        if let Err(e) = run_setup_once(
            self.config.daemon.setup_script.as_deref(),
            &self.layout.setup_marker(),
        )
        .await
        {
            log::error!("One-time setup failed: {}", e);
        }

        let pid_file = self.layout.daemon_pid_file();
        if signal_running(&pid_file, Signal::SIGCONT) {
            log::info!("Another daemon is running ({:?}), exiting", pid_file);
            return Ok(());
        }

        let result = self.serve().await;
        let _ = std::fs::remove_file(&pid_file);
        result
    }

    async fn serve(&self) -> Result<()> {
        let config = &self.config;
        let layout = &self.layout;

        let bus = Arc::new(EventBus::new());
        let store = Arc::new(SettingsStore::open(layout.settings_file())?);
        let servers = Arc::new(ServerStore::open(layout.servers_file())?);
        let global = Arc::new(GlobalState::load(store.clone(), bus.clone(), layout.env_file())?);

        let gateway = match RouteManager::new(self.runner.clone()).default_gateway().await {
            Ok(gateway) => gateway,
            Err(e) => {
                log::warn!("Failed to discover the default gateway: {}", e);
                None
            }
        };
        log::info!(
            "Default gateway: {}",
            gateway.map_or_else(|| "<none>".to_string(), |gw| gw.to_string())
        );
        global.set_default_gateway(gateway);
        if let Err(e) = global.write_env() {
            log::warn!("Failed to write {:?}: {}", global.env_file(), e);
        }

        let registry = Arc::new(ModuleRegistry::new());
        let paths = TunnelPaths::new(layout, &config.tunnel.program, &self.hook_exe);
        registry.register(Arc::new(TunnelModule::new(store.clone(), servers, paths)?))?;
        for (kind, section) in [
            (ProxyKind::Http, &config.http_proxy),
            (ProxyKind::Socks, &config.socks_proxy),
        ] {
            let module = ProxyModule::new(kind, section.clone(), layout, store.clone(), global.clone())?;
            registry.register(Arc::new(module))?;
        }

        let network = Arc::new(
            NetworkTransitionManager::new(
                self.runner.clone(),
                ResolverFile::new(&config.network.resolv_conf),
                &config.network.primary_device,
                config.daemon.port,
            )
            .with_app_script(config.daemon.app_script.clone()),
        );
        network.set_fallback_gateway(gateway);
        bus.subscribe(EventKind::VpnUp, network.clone());
        bus.subscribe(EventKind::VpnDown, network);
        registry.subscribe_all(&bus);
        bus.subscribe(
            EventKind::Shutdown,
            Arc::new(ShutdownForwarder(self.shutdown_tx.clone())),
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let signals = SignalBridge::new(bus.clone(), layout.netspec_file()).start()?;
        write_pid(&layout.daemon_pid_file())?;

        let context = ControlContext {
            routes: registry.routes(),
            registry: registry.clone(),
            global,
            bus,
        };
        let control = Arc::new(ControlServer::new(layout.control_socket(), Arc::new(context)));
        let control_task = match control.clone().start() {
            Ok(task) => Some(task),
            Err(e) => {
                log::error!("Control socket unavailable: {}", e);
                None
            }
        };

        registry.autostart().await;
        log::info!(
            "Daemon ready: data={:?} port={} static={:?}",
            layout.data_dir,
            config.daemon.port,
            config.daemon.static_dir
        );

        let _ = shutdown_rx.recv().await;
        log::info!("Shutting down");

        registry.stop_all().await;
        signals.abort();
        if let Some(task) = control_task {
            task.abort();
        }
        control.cleanup();
        Ok(())
    }
}
