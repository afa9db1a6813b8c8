//! Tunnel client hook hand-off
//!
//! The tunnel client runs this executable as its up/down script. The hook
//! process never touches host state itself: on `up` it leaves the network
//! spec in `var/netspec.json`, then wakes the daemon with SIGUSR1; on `down`
//! it sends SIGUSR2.

use nix::sys::signal::Signal;

use crate::config::DataLayout;
use crate::error::Result;
use crate::event::{NetSpec, ScriptType};
use crate::signal::signal_running;
use crate::store::write_atomic;

/// Pass a tunnel edge to the running daemon
///
/// Returns whether a daemon accepted the signal.
pub fn hand_off(layout: &DataLayout, edge: ScriptType, spec: &NetSpec) -> Result<bool> {
    let sig = match edge {
        ScriptType::Up => {
            let json = serde_json::to_vec_pretty(spec)?;
            write_atomic(&layout.netspec_file(), &json, Some(0o644))?;
            Signal::SIGUSR1
        }
        ScriptType::Down => Signal::SIGUSR2,
    };

    let pid_file = layout.daemon_pid_file();
    let delivered = signal_running(&pid_file, sig);
    if delivered {
        log::info!("Notified daemon of tunnel {}", edge.as_arg());
    } else {
        log::warn!("No daemon answered at {:?}", pid_file);
    }
    Ok(delivered)
}
