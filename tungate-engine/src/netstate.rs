//! Network transitions on tunnel edges
//!
//! The manager is the only writer of the resolver file, the default route and
//! the inbound firewall. Each edge fully replaces the route and the rule set,
//! so a single `vpn-down` converges to the same host state no matter how many
//! `vpn-up` edges preceded it.

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tungate_net::{
    first_nameserver, CommandRunner, Firewall, FirewallPolicy, ResolverFile, Route, RouteManager,
};

use crate::bus::EventListener;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, NetSpec, ScriptType};
use crate::script::run_app_script;

/// Applies and reverts host network state
pub struct NetworkTransitionManager {
    routes: RouteManager,
    firewall: Firewall,
    resolver: ResolverFile,
    primary_device: String,
    management_port: u16,
    app_script: Option<String>,
    fallback_gateway: RwLock<Option<Ipv4Addr>>,
    lock: tokio::sync::Mutex<()>,
}

impl NetworkTransitionManager {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        resolver: ResolverFile,
        primary_device: impl Into<String>,
        management_port: u16,
    ) -> Self {
        Self {
            routes: RouteManager::new(runner.clone()),
            firewall: Firewall::new(runner),
            resolver,
            primary_device: primary_device.into(),
            management_port,
            app_script: None,
            fallback_gateway: RwLock::new(None),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Script run with `up`/`down` after each transition
    pub fn with_app_script(mut self, script: Option<String>) -> Self {
        self.app_script = script;
        self
    }

    /// Host gateway used on `vpn-down` when the resolver backup names none
    pub fn set_fallback_gateway(&self, gateway: Option<Ipv4Addr>) {
        match self.fallback_gateway.write() {
            Ok(mut gw) => *gw = gateway,
            Err(poisoned) => *poisoned.into_inner() = gateway,
        }
    }

    fn fallback_gateway(&self) -> Option<Ipv4Addr> {
        match self.fallback_gateway.read() {
            Ok(gw) => *gw,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Route everything through the tunnel described by `spec`
    ///
    /// Every step is attempted; the first failure is returned.
    pub async fn vpn_up(&self, spec: &NetSpec) -> Result<()> {
        let _guard = self.lock.lock().await;
        log::info!("vpn up: device={} gateway={}", spec.device, spec.gateway);
        let mut first_error = None;

        record(&mut first_error, "resolver backup", self.resolver.backup_once().await);
        record(
            &mut first_error,
            "resolver update",
            self.resolver.write(&spec.resolv_conf()).await,
        );

        let route = Route::default_via_str(&spec.gateway).map(|r| r.with_interface(&spec.device));
        match route {
            Ok(route) => record(
                &mut first_error,
                "default route",
                self.routes.replace_default(&route).await,
            ),
            Err(e) => record::<()>(&mut first_error, "default route", Err(e)),
        }

        record(
            &mut first_error,
            "firewall",
            self.firewall
                .replace(&FirewallPolicy::tunnel_up(&spec.device))
                .await,
        );

        run_app_script(self.app_script.as_deref(), ScriptType::Up).await;

        first_error.map_or(Ok(()), Err)
    }

    /// Restore the pre-tunnel resolver, route and a locked-down firewall
    ///
    /// The host gateway is the first `nameserver` of the resolver backup,
    /// falling back to the gateway discovered at start-up.
    pub async fn vpn_down(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        log::info!("vpn down");
        let mut first_error = None;

        let restored = match self.resolver.restore().await {
            Ok(content) => content,
            Err(e) => {
                record::<()>(&mut first_error, "resolver restore", Err(e));
                None
            }
        };
        let host_gateway = restored
            .as_deref()
            .and_then(first_nameserver)
            .map(str::to_string)
            .or_else(|| self.fallback_gateway().map(|gw| gw.to_string()));
        log::info!("host gateway: {}", host_gateway.as_deref().unwrap_or("<none>"));

        record(
            &mut first_error,
            "resolver backup removal",
            self.resolver.remove_backup().await,
        );

        match host_gateway {
            Some(gateway) => {
                let route = Route::default_via_str(&gateway)
                    .map(|r| r.with_interface(&self.primary_device));
                match route {
                    Ok(route) => record(
                        &mut first_error,
                        "default route",
                        self.routes.replace_default(&route).await,
                    ),
                    Err(e) => record::<()>(&mut first_error, "default route", Err(e)),
                }
            }
            None => record::<()>(
                &mut first_error,
                "default route",
                Err(tungate_net::Error::Route("no host gateway known".into())),
            ),
        }

        record(
            &mut first_error,
            "firewall",
            self.firewall
                .replace(&FirewallPolicy::tunnel_down(self.management_port))
                .await,
        );

        run_app_script(self.app_script.as_deref(), ScriptType::Down).await;

        first_error.map_or(Ok(()), Err)
    }
}

fn record<T>(first: &mut Option<Error>, step: &str, result: tungate_net::Result<T>) {
    if let Err(e) = result {
        log::error!("{} failed: {}", step, e);
        first.get_or_insert(Error::Net(e));
    }
}

#[async_trait]
impl EventListener for NetworkTransitionManager {
    async fn handle_event(&self, event: &Event) {
        let result = match event.kind {
            EventKind::VpnUp => match event.net_spec() {
                Some(spec) => self.vpn_up(spec).await,
                None => {
                    log::error!("vpn-up without a network spec, host state unchanged");
                    return;
                }
            },
            EventKind::VpnDown => self.vpn_down().await,
            _ => return,
        };
        if let Err(e) = result {
            log::error!("{} transition incomplete: {}", event.kind, e);
        }
    }
}
