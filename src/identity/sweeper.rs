//! Background removal of expired records.
//!
//! Expiry is already enforced at read time, so sweeping only bounds storage
//! growth. A sweep may be skipped, delayed or run alongside requests.

use crate::store::{RecordStore, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 3600;

#[derive(Clone, Copy, Debug)]
pub struct SweeperConfig {
    interval: Duration,
}

impl SweeperConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let interval = if self.interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.interval
        };
        Self { interval }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one sweep and log the outcome.
pub async fn sweep_once(store: &dyn RecordStore) -> anyhow::Result<SweepReport> {
    let report = store.sweep_expired().await?;
    if report.total() > 0 {
        info!(
            pre_users = report.pre_users,
            sessions = report.sessions,
            password_resets = report.password_resets,
            "swept expired records"
        );
    } else {
        debug!("sweep found nothing to remove");
    }
    Ok(report)
}

/// Running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for the loop to exit. An in-flight sweep is
    /// abandoned and its transaction rolled back.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            error!("sweeper task failed: {err}");
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the sweep loop. The first sweep runs immediately.
pub fn spawn_sweeper(store: Arc<dyn RecordStore>, config: SweeperConfig) -> SweeperHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let config = config.normalize();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = sweep_once(store.as_ref()) => {
                    if let Err(err) = result {
                        error!("expiry sweep failed: {err:#}");
                    }
                }
            }
        }
        debug!("sweeper stopped");
    });

    SweeperHandle { shutdown, task }
}
