//! OS signal bridge
//!
//! Signals are the transport between the short-lived hook invocation and the
//! daemon. The bridge turns them into bus events:
//!
//! | Signal           | Event      |
//! |------------------|------------|
//! | SIGTERM, SIGINT  | `shutdown` |
//! | SIGUSR1          | `vpn-up`   |
//! | SIGUSR2          | `vpn-down` |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, NetSpec};

/// Forwards process signals to the [`EventBus`]
pub struct SignalBridge {
    bus: Arc<EventBus>,
    netspec_file: PathBuf,
}

impl SignalBridge {
    /// `netspec_file` is where the hook leaves the tunnel parameters before
    /// sending SIGUSR1
    pub fn new(bus: Arc<EventBus>, netspec_file: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            netspec_file: netspec_file.into(),
        }
    }

    /// Install the handlers and start forwarding
    ///
    /// Handlers are installed before this returns, so a signal sent after
    /// `start` is never lost. Must be called from within a tokio runtime.
    pub fn start(self) -> Result<JoinHandle<()>> {
        let install = |kind: SignalKind, name: &str| {
            signal(kind).map_err(|e| Error::Signal(format!("failed to install {} handler: {}", name, e)))
        };
        let mut term = install(SignalKind::terminate(), "SIGTERM")?;
        let mut int = install(SignalKind::interrupt(), "SIGINT")?;
        let mut usr1 = install(SignalKind::user_defined1(), "SIGUSR1")?;
        let mut usr2 = install(SignalKind::user_defined2(), "SIGUSR2")?;

        log::debug!("Signal bridge installed");

        Ok(tokio::spawn(async move {
            loop {
                let kind = tokio::select! {
                    Some(()) = term.recv() => {
                        log::info!("Received SIGTERM");
                        EventKind::Shutdown
                    }
                    Some(()) = int.recv() => {
                        log::info!("Received SIGINT");
                        EventKind::Shutdown
                    }
                    Some(()) = usr1.recv() => {
                        log::info!("Received SIGUSR1");
                        EventKind::VpnUp
                    }
                    Some(()) = usr2.recv() => {
                        log::info!("Received SIGUSR2");
                        EventKind::VpnDown
                    }
                    else => break,
                };

                let event = match kind {
                    EventKind::VpnUp => Event::vpn_up(self.load_netspec().await),
                    other => Event::new(other),
                };
                let _ = self.bus.publish(event);
            }
        }))
    }

    async fn load_netspec(&self) -> Option<NetSpec> {
        let content = match tokio::fs::read_to_string(&self.netspec_file).await {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "No tunnel network spec at {:?}: {}",
                    self.netspec_file,
                    e
                );
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(spec) => Some(spec),
            Err(e) => {
                log::warn!("Invalid tunnel network spec {:?}: {}", self.netspec_file, e);
                None
            }
        }
    }
}

/// Read a pid from `pid_file`
pub fn read_pid(pid_file: &Path) -> Option<i32> {
    let content = std::fs::read_to_string(pid_file).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    (pid > 0).then_some(pid)
}

/// Write the current process id to `pid_file`
pub fn write_pid(pid_file: &Path) -> Result<()> {
    std::fs::write(pid_file, std::process::id().to_string())?;
    Ok(())
}

/// Deliver `sig` to the process named in `pid_file`
///
/// Returns `true` only if the pid file names a live process that accepted the
/// signal. A missing or garbled pid file and a dead process all yield `false`.
pub fn signal_running(pid_file: &Path, sig: Signal) -> bool {
    let Some(pid) = read_pid(pid_file) else {
        return false;
    };
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => true,
        Err(e) => {
            log::debug!("Signal {} to pid {} failed: {}", sig, pid, e);
            false
        }
    }
}
