//! Dead-session reaper.
//!
//! Shell sessions register themselves as reference holders by PID.  A shell
//! that exits uncleanly never sends a deactivate, so the reaper sweeps the
//! tracked PIDs every 30 s and removes sessions whose process is gone.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ContextManager;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub type LivenessProbe = Box<dyn Fn(i32) -> bool + Send + Sync>;

pub struct SessionReaper {
    manager: Arc<ContextManager>,
    interval: Duration,
    is_alive: LivenessProbe,
}

impl SessionReaper {
    pub fn new(manager: Arc<ContextManager>) -> Self {
        Self {
            manager,
            interval: SWEEP_INTERVAL,
            is_alive: Box::new(process_alive),
        }
    }

    /// Replace the liveness probe (tests).
    pub fn with_probe(manager: Arc<ContextManager>, is_alive: LivenessProbe) -> Self {
        Self {
            manager,
            interval: SWEEP_INTERVAL,
            is_alive,
        }
    }

    /// Sweep at the configured interval until cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.sweep(),
            }
        }
    }

    pub fn sweep(&self) {
        for pid in self.manager.tracked_pids() {
            if !(self.is_alive)(pid) {
                let dirs = self.manager.remove_session(pid);
                if !dirs.is_empty() {
                    info!(pid, deactivated = ?dirs, "reaped dead session");
                }
            }
        }
    }
}

/// `kill(pid, 0)` succeeds iff the process exists and is signalable.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
