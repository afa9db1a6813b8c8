//! Script execution for tunnel transitions and first-boot setup
//!
//! Two kinds of user scripts are supported:
//!
//! - the app script, run with `up` or `down` after each tunnel transition
//! - the setup script, run once per data volume before the daemon starts
//!   anything else

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tungate_net::command::SYSTEM_PATH;

use crate::error::{Error, Result};
use crate::event::ScriptType;

impl ScriptType {
    /// Argument passed to the app script
    pub fn as_arg(&self) -> &'static str {
        match self {
            ScriptType::Up => "up",
            ScriptType::Down => "down",
        }
    }
}

/// Run `script` through `/bin/sh -c` with `args` appended
///
/// Returns `Ok(())` if the script exits with code 0, otherwise an error.
pub async fn run_script(script: &str, args: &[&str]) -> Result<()> {
    let line = if args.is_empty() {
        script.to_string()
    } else {
        format!("{} {}", script, args.join(" "))
    };
    log::info!("Running script: {}", line);

    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&line)
        .env("PATH", SYSTEM_PATH)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let output = command
        .output()
        .await
        .map_err(|e| Error::Script(format!("failed to execute script: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let exit_code = output.status.code().unwrap_or(-1);

        log::error!(
            "Script failed with exit code {}: stdout={}, stderr={}",
            exit_code,
            stdout.trim(),
            stderr.trim()
        );

        return Err(Error::Script(format!(
            "script exited with code {}: {}",
            exit_code,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.is_empty() {
        log::debug!("Script output: {}", stdout.trim());
    }

    Ok(())
}

/// Run the app script for a tunnel transition, if configured
///
/// Errors are logged, not propagated: the transition itself already happened.
pub async fn run_app_script(script: Option<&str>, edge: ScriptType) {
    if let Some(script) = script {
        match run_script(script, &[edge.as_arg()]).await {
            Ok(()) => log::info!("App script ({}) completed", edge.as_arg()),
            Err(e) => log::error!("App script ({}) failed: {}", edge.as_arg(), e),
        }
    }
}

/// Run the setup script unless `marker` shows it already succeeded
///
/// The marker is written only after a successful run, so a failed setup is
/// retried on the next start. Returns `true` if the script ran.
pub async fn run_setup_once(script: Option<&str>, marker: &Path) -> Result<bool> {
    let Some(script) = script else {
        return Ok(false);
    };
    if marker.exists() {
        log::debug!("Setup already completed ({:?})", marker);
        return Ok(false);
    }

    log::info!("Running one-time setup");
    run_script(script, &[]).await?;
    std::fs::write(marker, "")?;
    log::info!("One-time setup completed");
    Ok(true)
}
