//! Handle on one externally spawned process
//!
//! A [`ProcessHandle`] owns at most one live child. The check that no child
//! is live and the transition to [`ProcessState::Starting`] happen in one
//! atomic step, so concurrent starts spawn exactly one process. A signal sent
//! while the child is still starting is held back and delivered as soon as
//! its pid is known.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tungate_net::command::{format_command, SYSTEM_PATH};

use crate::error::{Error, Result};

/// Lifecycle of the process behind a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Never started
    Absent,
    /// Spawn in progress
    Starting,
    /// Child is alive
    Running { pid: u32 },
    /// Child exited; a new one may be started
    Exited { code: Option<i32> },
}

impl ProcessState {
    /// Whether a child is being spawned or is alive
    pub fn is_live(&self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running { .. })
    }
}

/// How to launch a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Extra environment on top of the inherited one and the minimal `PATH`
    pub env: Vec<(String, String)>,
    /// Put the child in its own process group
    pub process_group: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            process_group: true,
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("PATH", SYSTEM_PATH)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(ref dir) = self.current_dir {
            command.current_dir(dir);
        }
        if self.process_group {
            command.process_group(0);
        }
        command
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_command(&self.program, &self.args))
    }
}

/// Zero-or-one external process
pub struct ProcessHandle {
    name: String,
    pid_file: Option<PathBuf>,
    state: watch::Sender<ProcessState>,
    /// Signal requested during `Starting`; only touched with `state` locked
    pending: Mutex<Option<Signal>>,
}

impl ProcessHandle {
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ProcessState::Absent);
        Self {
            name: name.into(),
            pid_file: None,
            state,
            pending: Mutex::new(None),
        }
    }

    /// Write the child's pid here while it runs
    pub fn with_pid_file(mut self, pid_file: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(pid_file.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_live()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.state() {
            ProcessState::Running { pid } => Some(pid),
            _ => None,
        }
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Spawn a child unless one is already live
    ///
    /// Returns `Ok(None)` without spawning when a child is starting or
    /// running. The caller must hand the returned child to [`Self::wait`].
    pub fn spawn(&self, spec: &CommandSpec) -> Result<Option<Child>> {
        if !self.claim() {
            log::debug!("{} already running, not starting another", self.name);
            return Ok(None);
        }
        self.launch(spec).map(Some)
    }

    /// Move to `Starting` unless a child is live
    fn claim(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_live() {
                false
            } else {
                *state = ProcessState::Starting;
                self.set_pending(None);
                true
            }
        })
    }

    /// Spawn the child for a successful [`Self::claim`]
    fn launch(&self, spec: &CommandSpec) -> Result<Child> {
        log::info!("Starting {}: {}", self.name, spec);
        let child = match spec.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state.send_modify(|state| {
                    *state = ProcessState::Absent;
                    self.set_pending(None);
                });
                return Err(Error::Spawn {
                    program: spec.program.clone(),
                    message: e.to_string(),
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        if let Some(ref pid_file) = self.pid_file {
            if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
                log::warn!("Failed to write pid file {:?}: {}", pid_file, e);
            }
        }
        log::info!("{} started with pid {}", self.name, pid);

        let mut deferred = None;
        self.state.send_modify(|state| {
            *state = ProcessState::Running { pid };
            deferred = self.set_pending(None);
        });
        if let Some(sig) = deferred {
            if let Err(e) = self.deliver(pid, sig) {
                log::warn!("{}", e);
            }
        }
        Ok(child)
    }

    /// Replace the held-back signal, returning the previous one
    fn set_pending(&self, sig: Option<Signal>) -> Option<Signal> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::replace(&mut *pending, sig),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), sig),
        }
    }

    /// Block until `child` exits, then remove the pid file
    pub async fn wait(&self, mut child: Child) -> Option<ExitStatus> {
        let status = match child.wait().await {
            Ok(status) => {
                log::info!("{} exited with status: {}", self.name, status);
                Some(status)
            }
            Err(e) => {
                log::warn!("Failed to wait for {}: {}", self.name, e);
                None
            }
        };

        if let Some(ref pid_file) = self.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
        self.state.send_replace(ProcessState::Exited {
            code: status.and_then(|s| s.code()),
        });
        status
    }

    /// Spawn a child and wait for it in a background task
    ///
    /// Returns `false` if a child was already live.
    pub fn start_detached(self: &Arc<Self>, spec: &CommandSpec) -> Result<bool> {
        match self.spawn(spec)? {
            Some(child) => {
                let handle = self.clone();
                tokio::spawn(async move {
                    handle.wait(child).await;
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send `sig` to the live child
    ///
    /// While the child is starting the signal is held and delivered once it
    /// runs. Returns `false` when there is no child to signal.
    pub fn signal(&self, sig: Signal) -> Result<bool> {
        let mut target = None;
        let mut held = false;
        self.state.send_if_modified(|state| {
            match *state {
                ProcessState::Running { pid } => target = Some(pid),
                ProcessState::Starting => {
                    self.set_pending(Some(sig));
                    held = true;
                }
                _ => {}
            }
            false
        });

        match target {
            Some(pid) => self.deliver(pid, sig).map(|_| true),
            None if held => {
                log::info!("{} is starting, holding {} until it runs", self.name, sig);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn deliver(&self, pid: u32, sig: Signal) -> Result<()> {
        log::info!("Sending {} to {} (pid {})", sig, self.name, pid);
        kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| Error::Signal(format!("failed to signal {}: {}", self.name, e)))
    }

    /// Wait until no child is live
    pub async fn wait_until_absent(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| !state.is_live()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_spawn_and_wait_manages_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("sleep.pid");
        let handle = ProcessHandle::new("sleep").with_pid_file(&pid_file);

        let child = handle
            .spawn(&CommandSpec::new("sleep").args(["0.2"]))
            .unwrap()
            .unwrap();
        assert!(handle.is_running());
        assert!(handle.pid().is_some());
        assert!(pid_file.exists());

        let status = handle.wait(child).await.unwrap();
        assert!(status.success());
        assert!(!handle.is_running());
        assert!(!pid_file.exists());
        assert_eq!(handle.state(), ProcessState::Exited { code: Some(0) });
    }

    #[tokio::test]
    async fn test_second_spawn_is_noop() {
        let handle = ProcessHandle::new("sleep");
        let spec = CommandSpec::new("sleep").args(["5"]);

        let child = handle.spawn(&spec).unwrap().unwrap();
        assert!(handle.spawn(&spec).unwrap().is_none());

        assert!(handle.signal(Signal::SIGTERM).unwrap());
        handle.wait(child).await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure_resets_state() {
        let handle = ProcessHandle::new("missing");
        let result = handle.spawn(&CommandSpec::new("/nonexistent/tungate-missing"));
        assert!(matches!(result, Err(Error::Spawn { .. })));
        assert_eq!(handle.state(), ProcessState::Absent);
    }

    #[tokio::test]
    async fn test_signal_without_child() {
        let handle = ProcessHandle::new("idle");
        assert!(!handle.signal(Signal::SIGTERM).unwrap());
    }

    #[tokio::test]
    async fn test_signal_during_start_is_delivered() {
        use std::os::unix::process::ExitStatusExt;

        let handle = ProcessHandle::new("sleep");
        assert!(handle.claim());
        assert!(handle.signal(Signal::SIGTERM).unwrap());
        assert_eq!(handle.state(), ProcessState::Starting);

        let child = handle
            .launch(&CommandSpec::new("sleep").args(["30"]))
            .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait(child))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_held_signal_does_not_reach_next_child() {
        let handle = ProcessHandle::new("sleep");
        assert!(handle.claim());
        handle.signal(Signal::SIGTERM).unwrap();
        assert!(handle
            .launch(&CommandSpec::new("/nonexistent/tungate-missing"))
            .is_err());

        let child = handle
            .spawn(&CommandSpec::new("sleep").args(["30"]))
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_running());

        handle.signal(Signal::SIGKILL).unwrap();
        handle.wait(child).await;
    }

    #[tokio::test]
    async fn test_wait_until_absent_after_detached_start() {
        let handle = Arc::new(ProcessHandle::new("sleep"));
        assert!(handle
            .start_detached(&CommandSpec::new("sleep").args(["5"]))
            .unwrap());
        handle.signal(Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_until_absent())
            .await
            .unwrap();
    }
}
