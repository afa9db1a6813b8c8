//! Inbound firewall policy
//!
//! The gateway owns the host `INPUT` chain. Each policy is applied as a full
//! replacement: flush, then append every rule, so the result never depends on
//! what was installed before.
//!
//! # Security Note
//!
//! Applying a policy requires root (or `CAP_NET_ADMIN`) and drops every
//! inbound connection the policy does not explicitly accept.

use std::sync::Arc;

use crate::command::{args, CommandRunner};
use crate::error::{Error, Result};

/// Path to the `iptables` binary
pub const IPTABLES_BINARY: &str = "/sbin/iptables";

/// What happens to a matching packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
        }
    }
}

/// One rule appended to the `INPUT` chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// Only match packets arriving on this interface
    pub in_interface: Option<String>,
    /// Conntrack states to match, e.g. `ESTABLISHED,RELATED`
    pub ctstate: Option<String>,
    /// Only match TCP packets to this destination port
    pub tcp_dport: Option<u16>,
    /// Verdict for matching packets
    pub verdict: Verdict,
}

impl FirewallRule {
    /// A rule matching every inbound packet
    pub fn all(verdict: Verdict) -> Self {
        Self {
            in_interface: None,
            ctstate: None,
            tcp_dport: None,
            verdict,
        }
    }

    /// Restrict the rule to an inbound interface
    pub fn on_interface(mut self, interface: impl Into<String>) -> Self {
        self.in_interface = Some(interface.into());
        self
    }

    /// Restrict the rule to conntrack states
    pub fn with_ctstate(mut self, states: impl Into<String>) -> Self {
        self.ctstate = Some(states.into());
        self
    }

    /// Restrict the rule to a TCP destination port
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_dport = Some(port);
        self
    }

    /// Arguments for `iptables -A INPUT ...`
    pub fn append_args(&self) -> Vec<String> {
        let mut out = args(["-A", "INPUT"]);
        if let Some(ref iface) = self.in_interface {
            out.extend(args(["-i", iface.as_str()]));
        }
        if let Some(port) = self.tcp_dport {
            out.extend(args(["-p", "tcp", "--dport"]));
            out.push(port.to_string());
        }
        if let Some(ref states) = self.ctstate {
            out.extend(args(["-m", "conntrack", "--ctstate", states.as_str()]));
        }
        out.extend(args(["-j", self.verdict.as_str()]));
        out
    }
}

impl std::fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.append_args().join(" "))
    }
}

/// An ordered, complete inbound rule set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallPolicy {
    pub rules: Vec<FirewallRule>,
}

impl FirewallPolicy {
    /// Policy while the tunnel is up: only replies may enter through the tunnel
    pub fn tunnel_up(device: &str) -> Self {
        Self {
            rules: vec![
                FirewallRule::all(Verdict::Accept)
                    .on_interface(device)
                    .with_ctstate("ESTABLISHED,RELATED"),
                FirewallRule::all(Verdict::Drop).on_interface(device),
            ],
        }
    }

    /// Policy while the tunnel is down: replies plus the management port
    pub fn tunnel_down(management_port: u16) -> Self {
        Self {
            rules: vec![
                FirewallRule::all(Verdict::Accept).with_ctstate("RELATED,ESTABLISHED"),
                FirewallRule::all(Verdict::Accept).tcp_port(management_port),
                FirewallRule::all(Verdict::Drop),
            ],
        }
    }
}

/// Applies [`FirewallPolicy`] values through `iptables`
pub struct Firewall {
    runner: Arc<dyn CommandRunner>,
    iptables: String,
}

impl Firewall {
    /// Create a new firewall manager
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            iptables: IPTABLES_BINARY.to_string(),
        }
    }

    /// Override the `iptables` binary path
    pub fn with_binary(mut self, iptables: impl Into<String>) -> Self {
        self.iptables = iptables.into();
        self
    }

    /// Flush the `INPUT` chain and install `policy`
    ///
    /// Every rule is attempted even if an earlier step failed; the first
    /// failure is returned.
    pub async fn replace(&self, policy: &FirewallPolicy) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Err(e) = self.runner.run(&self.iptables, &args(["-F", "INPUT"])).await {
            log::error!("Failed to flush firewall rules: {}", e);
            first_error = Some(Error::Firewall(format!("flush failed: {}", e)));
        }

        for rule in &policy.rules {
            if let Err(e) = self.runner.run(&self.iptables, &rule.append_args()).await {
                log::error!("Failed to add firewall rule `{}`: {}", rule, e);
                first_error
                    .get_or_insert_with(|| Error::Firewall(format!("`{}` failed: {}", rule, e)));
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("Firewall policy applied ({} rules)", policy.rules.len());
                Ok(())
            }
        }
    }
}
