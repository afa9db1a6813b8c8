//! Host command execution
//!
//! Every change to routes and firewall rules goes through a [`CommandRunner`].
//! The system runner executes the real binaries; tests substitute a recorder.

use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Minimal `PATH` given to every host command
pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Executes host commands and returns their standard output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, failing if it cannot be spawned or exits non-zero
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands on the host, each in its own process group
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let display = format_command(program, args);
        log::info!("Executing: {}", display);

        let mut command = Command::new(program);
        command
            .args(args)
            .env("PATH", SYSTEM_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let output = command.output().await.map_err(|e| Error::Command {
            command: display.clone(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Command {
                command: display,
                message: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Records every command instead of executing it
///
/// Commands whose rendered line starts with one of the `failing` prefixes
/// return an error; everything else succeeds with the canned output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<String>>,
    failing: Vec<String>,
    output: String,
}

impl RecordingRunner {
    /// Create a runner where every command succeeds with empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commands starting with `prefix` fail
    pub fn failing(mut self, prefix: impl Into<String>) -> Self {
        self.failing.push(prefix.into());
        self
    }

    /// Output returned by successful commands
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Rendered command lines in execution order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Forget recorded commands
    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let line = format_command(program, args);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }
        if self.failing.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return Err(Error::Command {
                command: line,
                message: "simulated failure".to_string(),
            });
        }
        Ok(self.output.clone())
    }
}

/// Render a command line for logs and error messages
pub fn format_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Convert borrowed arguments into the owned form [`CommandRunner::run`] takes
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
