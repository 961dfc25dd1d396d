//! Recovery Worker
//!
//! Background loop that runs the inspection sweep on a fixed interval.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::WorkerSettings;
use crate::core_types::now_ms;

use super::coordinator::TransferCoordinator;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to run the sweep
    pub scan_interval: Duration,
    /// How long a saga must sit untouched to be considered stuck
    pub stale_threshold: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
        }
    }
}

impl From<&WorkerSettings> for WorkerConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            scan_interval: settings.scan_interval(),
            stale_threshold: settings.stale_threshold(),
        }
    }
}

pub struct RecoveryWorker {
    coordinator: Arc<TransferCoordinator>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(coordinator: Arc<TransferCoordinator>, config: WorkerConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub fn with_defaults(coordinator: Arc<TransferCoordinator>) -> Self {
        Self::new(coordinator, WorkerConfig::default())
    }

    /// Run the sweep forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        loop {
            self.sweep_once().await;
            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One sweep over sagas older than the stale threshold.
    /// Returns the number of sagas left unresolved.
    pub async fn sweep_once(&self) -> usize {
        let deadline = now_ms() - self.config.stale_threshold.as_millis() as i64;
        let errors = self.coordinator.inspect(deadline).await;
        for e in &errors {
            error!(code = e.code(), error = %e, "Saga left unresolved by sweep");
        }
        errors.len()
    }
}
