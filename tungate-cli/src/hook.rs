//! Hook mode: report a tunnel edge to the daemon
//!
//! Always exits successfully so the tunnel client never aborts on it.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use tungate_engine::{hand_off, DaemonConfig, DataLayout, NetSpec, ScriptType};

use crate::Cli;

pub fn run(cli: &Cli) {
    let script_type = std::env::var("script_type").unwrap_or_default();
    let edge: ScriptType = match script_type.parse() {
        Ok(edge) => edge,
        Err(e) => {
            warn!("Ignoring hook invocation: {}", e);
            return;
        }
    };

    let layout = DataLayout::new(data_dir(cli, std::env::current_dir().ok().as_deref()));
    let spec = NetSpec::from_env();
    info!(
        "Tunnel {} on {} via {} ({:?})",
        edge.as_arg(),
        spec.device,
        spec.gateway,
        layout.data_dir
    );

    if let Err(e) = hand_off(&layout, edge, &spec) {
        warn!("Failed to notify daemon: {}", e);
    }
}

/// Data directory for a hook invocation
///
/// `--data` or `TUNGATE_DATA` win; otherwise the tunnel client's working
/// directory (`<data>/var`) points at it.
fn data_dir(cli: &Cli, cwd: Option<&Path>) -> PathBuf {
    if let Some(ref data) = cli.data {
        return data.clone();
    }
    match cwd {
        Some(cwd) if cwd.file_name().is_some_and(|name| name == "var") => cwd
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| DaemonConfig::default().daemon.data_dir),
        _ => DaemonConfig::default().daemon.data_dir,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn hook_cli(extra: &[&str]) -> Cli {
        let mut args = vec!["tungate"];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["tun0", "1500"]);
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_data_dir_from_flag() {
        let cli = hook_cli(&["--data", "/srv/tungate"]);
        assert_eq!(
            data_dir(&cli, Some(Path::new("/srv/tungate/var"))),
            PathBuf::from("/srv/tungate")
        );
    }

    #[test]
    fn test_data_dir_from_working_directory() {
        let mut cli = hook_cli(&[]);
        cli.data = None;
        assert_eq!(
            data_dir(&cli, Some(Path::new("/mnt/volume/var"))),
            PathBuf::from("/mnt/volume")
        );
        assert_eq!(data_dir(&cli, Some(Path::new("/tmp"))), PathBuf::from("/data"));
        assert_eq!(data_dir(&cli, None), PathBuf::from("/data"));
    }
}
