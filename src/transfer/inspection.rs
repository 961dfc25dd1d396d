//! Inspection sweep
//!
//! Drives every stale non-terminal saga to a terminal status:
//! HALF_SUCCESS is completed forward, DOING and ROLLBACK_DOING are rolled
//! back. One failing saga never stops the scan.

use tracing::{debug, info, warn};

use crate::core_types::TimestampMs;

use super::error::TransferError;
use super::executor::SagaExecutor;
use super::rollback::Compensator;
use super::saga::SagaRepository;
use super::state::SagaStatus;
use super::types::SagaState;

#[derive(Clone)]
pub struct InspectionSweeper {
    sagas: SagaRepository,
    executor: SagaExecutor,
    compensator: Compensator,
}

impl InspectionSweeper {
    pub fn new(sagas: SagaRepository, executor: SagaExecutor, compensator: Compensator) -> Self {
        Self {
            sagas,
            executor,
            compensator,
        }
    }

    /// Sweep sagas last updated at or before `deadline`.
    ///
    /// Returns the error of every saga that could not be resolved.
    pub async fn inspect(&self, deadline: TimestampMs) -> Vec<TransferError> {
        let stale = match self.sagas.stale(deadline).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Inspection scan failed");
                return vec![e];
            }
        };

        if stale.is_empty() {
            debug!("No stale sagas found");
            return Vec::new();
        }
        info!(count = stale.len(), "Found stale sagas to inspect");

        let mut errors = Vec::new();
        for saga in &stale {
            if let Err(e) = self.resolve(saga).await {
                warn!(
                    transfer_id = saga.transfer_id,
                    scene = saga.scene,
                    status = %saga.status,
                    error = %e,
                    "Inspection could not resolve saga"
                );
                errors.push(e);
            }
        }

        info!(
            inspected = stale.len(),
            failed = errors.len(),
            "Inspection sweep complete"
        );
        errors
    }

    async fn resolve(&self, saga: &SagaState) -> Result<(), TransferError> {
        match saga.status {
            SagaStatus::HalfSuccess => self.executor.complete_half_success(saga).await,
            SagaStatus::Doing | SagaStatus::RollbackDoing => {
                self.compensator.rollback_saga(saga).await
            }
            SagaStatus::Success | SagaStatus::RollbackDone => Ok(()),
        }
    }
}
