//! Tunnel supervisor
//!
//! Keeps the tunnel client alive: spawn it, wait for it to exit, spawn it
//! again while the owning module still wants it running. At most one loop is
//! active per supervisor; starting an active supervisor does nothing.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::Result;
use crate::process::{CommandSpec, ProcessHandle};

/// Minimum delay after a failed spawn
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(60);

/// What the supervisor needs to know about the process it keeps alive
pub trait TunnelLaunch: Send + Sync {
    /// Checked before every attempt; the loop ends once this is false
    fn should_run(&self) -> bool;

    /// Files that must exist before spawning
    fn required_artifacts(&self) -> Vec<PathBuf>;

    /// Command line for the next attempt
    fn command(&self) -> CommandSpec;

    /// Configured delay after a failed spawn, floored at [`BACKOFF_FLOOR`]
    fn retry_interval(&self) -> Duration;
}

/// Retry loop around one [`ProcessHandle`]
#[derive(Clone)]
pub struct Supervisor {
    launch: Arc<dyn TunnelLaunch>,
    process: Arc<ProcessHandle>,
    active: Arc<AtomicBool>,
}

/// Clears the active flag when the loop ends, including by panic
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Supervisor {
    pub fn new(launch: Arc<dyn TunnelLaunch>, process: Arc<ProcessHandle>) -> Self {
        Self {
            launch,
            process,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The supervised process
    pub fn process(&self) -> &Arc<ProcessHandle> {
        &self.process
    }

    /// Whether a retry loop is running
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the loop in a background task
    ///
    /// Returns `false` if a loop was already active.
    pub fn start(&self) -> bool {
        let Some(guard) = self.claim() else {
            log::debug!("Supervisor for {} already active", self.process.name());
            return false;
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.supervise(guard).await;
        });
        true
    }

    /// Run the loop on the current task until it ends
    ///
    /// Returns immediately if a loop is already active.
    pub async fn run(&self) {
        if let Some(guard) = self.claim() {
            self.supervise(guard).await;
        }
    }

    /// Ask the child to terminate; the loop notices the exit on its own
    pub fn stop(&self) -> Result<bool> {
        self.process.signal(Signal::SIGTERM)
    }

    /// Force one supervised cycle
    ///
    /// With an active loop the child is terminated and the loop respawns it;
    /// otherwise a new loop is started.
    pub fn restart(&self) -> Result<()> {
        if self.is_active() {
            self.stop()?;
        } else {
            self.start();
        }
        Ok(())
    }

    fn claim(&self) -> Option<ActiveGuard> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ActiveGuard(self.active.clone()))
    }

    /// Run cycles until the loop is no longer wanted
    ///
    /// A `start` that lands after the last `should_run` check but before the
    /// active flag is cleared fails to claim the loop; the re-check after
    /// releasing the guard picks it up.
    async fn supervise(&self, guard: ActiveGuard) {
        let name = self.process.name().to_string();
        let mut guard = guard;

        loop {
            let stopped = self.cycles(&name).await;
            drop(guard);
            if !stopped || !self.launch.should_run() {
                break;
            }
            match self.claim() {
                Some(reclaimed) => {
                    log::info!("{} was started again while its supervisor finished", name);
                    guard = reclaimed;
                }
                None => break,
            }
        }

        log::info!("Supervisor for {} finished", name);
    }

    /// Spawn and wait while `should_run` holds
    ///
    /// Returns `false` when the loop ended on a configuration error.
    async fn cycles(&self, name: &str) -> bool {
        while self.launch.should_run() {
            let missing: Vec<PathBuf> = self
                .launch
                .required_artifacts()
                .into_iter()
                .filter(|path| !path.exists())
                .collect();
            if !missing.is_empty() {
                log::error!("{} config/auth file(s) not found: {:?}", name, missing);
                return false;
            }

            let spec = self.launch.command();
            match self.process.spawn(&spec) {
                Ok(Some(child)) => {
                    self.process.wait(child).await;
                }
                Ok(None) => {
                    log::warn!("{} was started outside the supervisor, waiting for it", name);
                    self.process.wait_until_absent().await;
                }
                Err(e) => {
                    let delay = self.launch.retry_interval().max(BACKOFF_FLOOR);
                    log::error!("{}; retrying in {}s", e, delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct FailingLaunch {
        attempts: Mutex<Vec<Instant>>,
        max_attempts: usize,
        retry: Duration,
    }

    impl TunnelLaunch for FailingLaunch {
        fn should_run(&self) -> bool {
            self.attempts.lock().unwrap().len() < self.max_attempts
        }

        fn required_artifacts(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn command(&self) -> CommandSpec {
            self.attempts.lock().unwrap().push(Instant::now());
            CommandSpec::new("/nonexistent/tungate-tunnel")
        }

        fn retry_interval(&self) -> Duration {
            self.retry
        }
    }

    struct SleepLaunch {
        run: AtomicBool,
        spawned: AtomicUsize,
        artifacts: Vec<PathBuf>,
    }

    impl TunnelLaunch for SleepLaunch {
        fn should_run(&self) -> bool {
            self.run.load(Ordering::SeqCst)
        }

        fn required_artifacts(&self) -> Vec<PathBuf> {
            self.artifacts.clone()
        }

        fn command(&self) -> CommandSpec {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            CommandSpec::new("sleep").args(["30"])
        }

        fn retry_interval(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    /// Exits at once; on its first "stop" a start request arrives while the
    /// loop is still active
    struct RacingLaunch {
        calls: AtomicUsize,
        spawned: AtomicUsize,
        supervisor: std::sync::OnceLock<Supervisor>,
        late_start_claimed: Mutex<Option<bool>>,
    }

    impl TunnelLaunch for RacingLaunch {
        fn should_run(&self) -> bool {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => true,
                1 => {
                    let claimed = self.supervisor.get().map(Supervisor::start);
                    *self.late_start_claimed.lock().unwrap() = claimed;
                    false
                }
                n => n < 4,
            }
        }

        fn required_artifacts(&self) -> Vec<PathBuf> {
            Vec::new()
        }

        fn command(&self) -> CommandSpec {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            CommandSpec::new("true")
        }

        fn retry_interval(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn process_running(state: &crate::process::ProcessState) -> bool {
        matches!(state, crate::process::ProcessState::Running { .. })
    }

    async fn check_backoff(retry: Duration, expected: Duration) {
        let launch = Arc::new(FailingLaunch {
            attempts: Mutex::new(Vec::new()),
            max_attempts: 3,
            retry,
        });
        let supervisor = Supervisor::new(launch.clone(), Arc::new(ProcessHandle::new("tunnel")));
        supervisor.run().await;

        let attempts = launch.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= expected);
        }
        assert!(!supervisor.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_floor_with_zero_retry() {
        check_backoff(Duration::ZERO, BACKOFF_FLOOR).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_uses_longer_retry_interval() {
        check_backoff(Duration::from_secs(600), Duration::from_secs(600)).await;
    }

    #[tokio::test]
    async fn test_missing_artifacts_end_loop() {
        let launch = Arc::new(SleepLaunch {
            run: AtomicBool::new(true),
            spawned: AtomicUsize::new(0),
            artifacts: vec![PathBuf::from("/nonexistent/vpn.ovpn")],
        });
        let supervisor = Supervisor::new(launch.clone(), Arc::new(ProcessHandle::new("tunnel")));
        supervisor.run().await;
        assert_eq!(launch.spawned.load(Ordering::SeqCst), 0);
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn test_start_while_loop_finishes_is_kept() {
        let launch = Arc::new(RacingLaunch {
            calls: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            supervisor: std::sync::OnceLock::new(),
            late_start_claimed: Mutex::new(None),
        });
        let supervisor = Supervisor::new(launch.clone(), Arc::new(ProcessHandle::new("tunnel")));
        let _ = launch.supervisor.set(supervisor.clone());

        tokio::time::timeout(Duration::from_secs(5), supervisor.run())
            .await
            .unwrap();

        assert_eq!(*launch.late_start_claimed.lock().unwrap(), Some(false));
        assert_eq!(launch.spawned.load(Ordering::SeqCst), 2);
        assert!(!supervisor.is_active());
    }

    #[tokio::test]
    async fn test_start_is_reentrant_noop() {
        let launch = Arc::new(SleepLaunch {
            run: AtomicBool::new(true),
            spawned: AtomicUsize::new(0),
            artifacts: Vec::new(),
        });
        let process = Arc::new(ProcessHandle::new("tunnel"));
        let supervisor = Supervisor::new(launch.clone(), process.clone());

        assert!(supervisor.start());
        assert!(!supervisor.start());

        let mut state = process.subscribe();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| process_running(s)))
            .await
            .unwrap()
            .unwrap();

        launch.run.store(false, Ordering::SeqCst);
        supervisor.stop().unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while supervisor.is_active() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(launch.spawned.load(Ordering::SeqCst), 1);
    }
}
