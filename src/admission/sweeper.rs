//! Background eviction of expired windows.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AdmissionController;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Result of one eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timestamp: u64,
    pub evicted: usize,
    pub remaining: usize,
}

pub struct Sweeper;

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime. The first pass runs
    /// one `interval` after spawning.
    pub fn spawn(controller: AdmissionController, interval: Duration) -> SweeperHandle {
        Self::spawn_with(controller, interval, |_| {})
    }

    /// Like [`Sweeper::spawn`], calling `on_pass` after every pass that
    /// evicted something.
    pub fn spawn_with<F>(controller: AdmissionController, interval: Duration, on_pass: F) -> SweeperHandle
    where
        F: Fn(SweepReport) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = controller.now_ms();
                        let evicted = controller.sweep(now);
                        if evicted > 0 {
                            let remaining = controller.store().len();
                            debug!(evicted, remaining, "sweep pass");
                            on_pass(SweepReport { timestamp: now, evicted, remaining });
                        }
                    }
                }
            }
            debug!("sweeper stopped");
        });

        info!("🧹 Sweeper running every {:?}", interval);
        SweeperHandle { cancel, task: Some(task) }
    }
}

/// Dropping the handle cancels the task without waiting for it.
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Cancel and wait for the loop to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Sweeper task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
