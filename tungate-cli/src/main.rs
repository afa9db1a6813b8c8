//! tungate
//!
//! Gateway daemon for a tunnel client and two proxies. The same binary is the
//! tunnel client's up/down hook.

mod hook;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tungate_engine::{Daemon, DaemonConfig};

/// tungate - tunnel gateway daemon
#[derive(Parser, Debug)]
#[command(name = "tungate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Management port; also the inbound port left open while the tunnel is down
    #[arg(short, long)]
    port: Option<u16>,

    /// Data directory
    #[arg(short, long, env = "TUNGATE_DATA")]
    data: Option<PathBuf>,

    /// Static asset directory for the HTTP front end
    #[arg(long = "static", value_name = "DIR")]
    static_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Write a sample configuration file and exit
    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,

    /// Arguments from the tunnel client when run as its hook (`tun0 1500 ...`)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
    hook: Vec<String>,
}

impl Cli {
    fn is_hook(&self) -> bool {
        self.hook.first().is_some_and(|arg| arg.starts_with("tun"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    if let Some(ref output) = cli.gen_config {
        return generate_config(output);
    }

    if cli.is_hook() {
        hook::run(&cli);
        return Ok(());
    }

    let config = load_config(&cli)?;
    run_daemon(config).await
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Configuration file (or defaults) with command-line overrides applied
fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    let mut config = match cli.config {
        Some(ref path) => DaemonConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => DaemonConfig::default(),
    };

    if let Some(port) = cli.port {
        config.daemon.port = port;
    }
    if let Some(ref data) = cli.data {
        config.daemon.data_dir = data.clone();
    }
    if let Some(ref static_dir) = cli.static_dir {
        config.daemon.static_dir = Some(static_dir.clone());
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!(
        "Starting tungate (data={:?}, port={})",
        config.daemon.data_dir, config.daemon.port
    );

    Daemon::new(config)
        .run()
        .await
        .context("Daemon failed")?;

    info!("tungate stopped");
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    std::fs::write(output, DaemonConfig::sample())
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    Ok(())
}
