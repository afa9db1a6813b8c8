//! Daemon configuration and data directory layout

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
///
/// Every section is optional; command-line flags override the `[daemon]`
/// values.
///
/// # Example Configuration
///
/// ```toml
/// [daemon]
/// port = 80
/// data_dir = "/data"
///
/// [network]
/// primary_device = "eth0"
///
/// [http_proxy]
/// port = 3128
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub tunnel: TunnelSection,

    #[serde(default = "ProxySection::http")]
    pub http_proxy: ProxySection,

    #[serde(default = "ProxySection::socks")]
    pub socks_proxy: ProxySection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration with the proxy sections filled in
    pub fn defaults() -> Self {
        Self {
            daemon: DaemonSection::default(),
            network: NetworkSection::default(),
            tunnel: TunnelSection::default(),
            http_proxy: ProxySection::http(),
            socks_proxy: ProxySection::socks(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.daemon.port == 0 {
            return Err(Error::Config("daemon.port must not be 0".into()));
        }
        if self.daemon.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("daemon.data_dir is required".into()));
        }
        if self.network.primary_device.is_empty() {
            return Err(Error::Config("network.primary_device is required".into()));
        }
        if self.tunnel.program.is_empty() {
            return Err(Error::Config("tunnel.program is required".into()));
        }
        self.http_proxy.validate("http_proxy")?;
        self.socks_proxy.validate("socks_proxy")?;
        Ok(())
    }

    /// Paths derived from the data directory
    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.daemon.data_dir)
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# tungate gateway configuration

[daemon]
# Management port. This is also the only inbound TCP port left open
# while the tunnel is down.
port = 80

# Data root. Holds config/ (settings, server records) and var/ (pid files,
# generated configs, control socket).
data_dir = "/data"

# Static asset directory, handed to the HTTP front end
# static_dir = "/app/static"

# Script run once per data volume before anything else
# setup_script = "/usr/local/bin/setup"

# Script run with "up" or "down" after each tunnel transition
# app_script = "/usr/local/bin/vpn-apps"

[network]
# Host device carrying the default route while the tunnel is down
primary_device = "eth0"

# Resolver file rewritten while the tunnel is up
resolv_conf = "/etc/resolv.conf"

[tunnel]
# Tunnel client binary
program = "openvpn"

[http_proxy]
program = "/usr/bin/tinyproxy"
args = ["-d", "-c", "{config}"]
port = 8888
# Template file; "{{port}}" is replaced with the port above.
# When unset a built-in template is used.
# template = "/etc/tinyproxy/tinyproxy.conf"

[socks_proxy]
program = "/usr/local/sbin/sockd"
args = ["-f", "{config}"]
port = 1080
# template = "/usr/local/etc/sockd.conf"
"#
        .to_string()
    }
}

/// `[daemon]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub static_dir: Option<PathBuf>,

    #[serde(default)]
    pub setup_script: Option<String>,

    #[serde(default)]
    pub app_script: Option<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            static_dir: None,
            setup_script: None,
            app_script: None,
        }
    }
}

/// `[network]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_primary_device")]
    pub primary_device: String,

    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            primary_device: default_primary_device(),
            resolv_conf: default_resolv_conf(),
        }
    }
}

/// `[tunnel]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_tunnel_program")]
    pub program: String,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            program: default_tunnel_program(),
        }
    }
}

/// `[http_proxy]` and `[socks_proxy]` sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySection {
    pub program: String,

    /// Arguments; `{config}` is replaced with the generated config path
    #[serde(default)]
    pub args: Vec<String>,

    /// Template file; the built-in template is used when unset
    #[serde(default)]
    pub template: Option<PathBuf>,

    pub port: u16,
}

impl ProxySection {
    /// Defaults for the HTTP proxy (tinyproxy)
    pub fn http() -> Self {
        Self {
            program: "/usr/bin/tinyproxy".into(),
            args: vec!["-d".into(), "-c".into(), "{config}".into()],
            template: None,
            port: 8888,
        }
    }

    /// Defaults for the SOCKS proxy (dante)
    pub fn socks() -> Self {
        Self {
            program: "/usr/local/sbin/sockd".into(),
            args: vec!["-f".into(), "{config}".into()],
            template: None,
            port: 1080,
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.program.is_empty() {
            return Err(Error::Config(format!("{}.program is required", section)));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("{}.port must not be 0", section)));
        }
        Ok(())
    }
}

/// Every path the daemon uses, derived from the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub var_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            config_dir: data_dir.join("config"),
            var_dir: data_dir.join("var"),
            data_dir,
        }
    }

    /// Create `config/` and `var/`
    pub fn create_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.var_dir)?;
        Ok(())
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    pub fn servers_file(&self) -> PathBuf {
        self.config_dir.join("servers.json")
    }

    pub fn setup_marker(&self) -> PathBuf {
        self.config_dir.join(".setup-complete")
    }

    /// The daemon's own pid file
    pub fn daemon_pid_file(&self) -> PathBuf {
        self.var_dir.join("tungate.pid")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.var_dir.join("tungate.sock")
    }

    /// NetSpec left by the hook for the daemon
    pub fn netspec_file(&self) -> PathBuf {
        self.var_dir.join("netspec.json")
    }

    pub fn env_file(&self) -> PathBuf {
        self.var_dir.join("env")
    }

    pub fn tunnel_config(&self) -> PathBuf {
        self.var_dir.join("vpn.ovpn")
    }

    pub fn tunnel_auth(&self) -> PathBuf {
        self.var_dir.join("vpn.auth")
    }

    pub fn tunnel_pid_file(&self) -> PathBuf {
        self.var_dir.join("openvpn.pid")
    }

    pub fn tunnel_log(&self) -> PathBuf {
        self.var_dir.join("openvpn.log")
    }

    pub fn tunnel_status(&self) -> PathBuf {
        self.var_dir.join("openvpn.status")
    }

    /// Generated config of a proxy module
    pub fn proxy_config(&self, module: &str) -> PathBuf {
        self.var_dir.join(format!("{}.conf", module))
    }

    pub fn proxy_pid_file(&self, module: &str) -> PathBuf {
        self.var_dir.join(format!("{}.pid", module))
    }
}

fn default_port() -> u16 {
    80
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_primary_device() -> String {
    "eth0".to_string()
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from(tungate_net::resolv::RESOLV_CONF)
}

fn default_tunnel_program() -> String {
    "openvpn".to_string()
}
