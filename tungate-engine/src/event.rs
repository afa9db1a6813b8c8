//! Gateway events and the tunnel network description

use serde::{Deserialize, Serialize};
use tungate_net::ResolvConf;

use crate::global::GlobalSettings;

/// The closed set of events the daemon reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// The tunnel came up
    VpnUp,
    /// The tunnel went down
    VpnDown,
    /// Global settings were saved with a new value
    GlobalSettingsChanged,
    /// The daemon is stopping
    Shutdown,
}

impl EventKind {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::VpnUp => "vpn-up",
            EventKind::VpnDown => "vpn-down",
            EventKind::GlobalSettingsChanged => "global-settings-changed",
            EventKind::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Payload attached to an event
#[derive(Debug, Clone, PartialEq)]
pub enum EventContext {
    /// Tunnel network spec, carried by `vpn-up`
    Net(NetSpec),
    /// The new global settings, carried by `global-settings-changed`
    Settings(GlobalSettings),
}

/// A published event; immutable once created
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub context: Option<EventContext>,
}

impl Event {
    /// Event without a payload
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// `vpn-up` carrying the tunnel network spec
    pub fn vpn_up(spec: Option<NetSpec>) -> Self {
        Self {
            kind: EventKind::VpnUp,
            context: spec.map(EventContext::Net),
        }
    }

    /// `global-settings-changed` carrying the new settings
    pub fn settings_changed(settings: GlobalSettings) -> Self {
        Self {
            kind: EventKind::GlobalSettingsChanged,
            context: Some(EventContext::Settings(settings)),
        }
    }

    /// The network spec, if this event carries one
    pub fn net_spec(&self) -> Option<&NetSpec> {
        match self.context {
            Some(EventContext::Net(ref spec)) => Some(spec),
            _ => None,
        }
    }

    /// The global settings, if this event carries them
    pub fn settings(&self) -> Option<&GlobalSettings> {
        match self.context {
            Some(EventContext::Settings(ref settings)) => Some(settings),
            _ => None,
        }
    }
}

/// Which edge a hook invocation reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    Up,
    Down,
}

impl std::str::FromStr for ScriptType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ScriptType::Up),
            "down" => Ok(ScriptType::Down),
            other => Err(format!("unknown script_type: {}", other)),
        }
    }
}

/// Network parameters pushed by the tunnel server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetSpec {
    /// Search domains (`dhcp-option DOMAIN`)
    #[serde(default)]
    pub domains: Vec<String>,
    /// Name servers (`dhcp-option DNS`)
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// Tunnel device, e.g. `tun0`
    pub device: String,
    /// Gateway on the tunnel side
    pub gateway: String,
}

const DOMAIN_OPTION: &str = "dhcp-option DOMAIN ";
const DNS_OPTION: &str = "dhcp-option DNS ";

impl NetSpec {
    /// Build from hook variables: `foreign_option_N`, `dev`, `route_vpn_gateway`
    ///
    /// `foreign_option_N` is scanned from 1 up to the first missing or empty
    /// variable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut spec = NetSpec {
            device: lookup("dev").unwrap_or_default(),
            gateway: lookup("route_vpn_gateway").unwrap_or_default(),
            ..Default::default()
        };

        for i in 1.. {
            let option = match lookup(&format!("foreign_option_{}", i)) {
                Some(v) if !v.is_empty() => v,
                _ => break,
            };
            if let Some(domain) = option.strip_prefix(DOMAIN_OPTION) {
                spec.domains.push(domain.to_string());
            } else if let Some(dns) = option.strip_prefix(DNS_OPTION) {
                spec.nameservers.push(dns.to_string());
            }
        }

        spec
    }

    /// Build from the current process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolver contents for this tunnel
    pub fn resolv_conf(&self) -> ResolvConf {
        ResolvConf {
            domains: self.domains.clone(),
            nameservers: self.nameservers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::VpnUp.name(), "vpn-up");
        assert_eq!(EventKind::VpnDown.to_string(), "vpn-down");
        assert_eq!(
            EventKind::GlobalSettingsChanged.name(),
            "global-settings-changed"
        );
        assert_eq!(EventKind::Shutdown.name(), "shutdown");
    }

    #[test]
    fn test_net_spec_from_hook_env() {
        let spec = NetSpec::from_lookup(lookup_from(&[
            ("dev", "tun0"),
            ("route_vpn_gateway", "10.8.0.1"),
            ("foreign_option_1", "dhcp-option DNS 10.8.0.1"),
            ("foreign_option_2", "dhcp-option DOMAIN corp.example"),
            ("foreign_option_3", "dhcp-option DNS 10.8.0.2"),
            ("foreign_option_4", "dhcp-option PROXY_HTTP 1.2.3.4 80"),
        ]));

        assert_eq!(spec.device, "tun0");
        assert_eq!(spec.gateway, "10.8.0.1");
        assert_eq!(spec.domains, vec!["corp.example"]);
        assert_eq!(spec.nameservers, vec!["10.8.0.1", "10.8.0.2"]);
    }

    #[test]
    fn test_net_spec_stops_at_gap() {
        let spec = NetSpec::from_lookup(lookup_from(&[
            ("foreign_option_1", "dhcp-option DNS 10.8.0.1"),
            ("foreign_option_3", "dhcp-option DNS 10.8.0.3"),
        ]));
        assert_eq!(spec.nameservers, vec!["10.8.0.1"]);
        assert!(spec.device.is_empty());
    }

    #[test]
    fn test_script_type_parse() {
        assert_eq!("up".parse::<ScriptType>(), Ok(ScriptType::Up));
        assert_eq!("down".parse::<ScriptType>(), Ok(ScriptType::Down));
        assert!("route-up".parse::<ScriptType>().is_err());
    }

    #[test]
    fn test_event_context_accessors() {
        let spec = NetSpec {
            device: "tun0".into(),
            ..Default::default()
        };
        let event = Event::vpn_up(Some(spec.clone()));
        assert_eq!(event.net_spec(), Some(&spec));
        assert!(event.settings().is_none());
        assert!(Event::new(EventKind::VpnDown).net_spec().is_none());
    }
}
