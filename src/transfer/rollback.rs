//! Saga compensation
//!
//! Compensation undoes the forward legs in reverse order of effect: every
//! destination leg is deducted back first, then every source leg is credited
//! back. Compensating deductions are unguarded, so a destination that already
//! spent the funds goes negative rather than blocking the rollback.

use tracing::{info, warn};

use super::error::TransferError;
use super::record::{LegOp, RecordLedger};
use super::saga::SagaRepository;
use super::state::{LegDirection, LegStatus, SagaStatus};
use super::types::{RollbackRequest, SagaState, TransferLeg};

#[derive(Clone)]
pub struct Compensator {
    ledger: RecordLedger,
    sagas: SagaRepository,
}

impl Compensator {
    pub fn new(ledger: RecordLedger, sagas: SagaRepository) -> Self {
        Self { ledger, sagas }
    }

    /// Caller-initiated rollback.
    ///
    /// An unknown transfer gets a terminal empty-rollback saga so that the
    /// transfer can never run afterwards.
    pub async fn rollback(&self, req: RollbackRequest) -> Result<(), TransferError> {
        let saga = match self.sagas.get(req.transfer_id, req.scene).await? {
            Some(saga) => saga,
            None => {
                let saga = self
                    .sagas
                    .create_empty_rollback(req.transfer_id, req.scene)
                    .await?;
                if saga.status == SagaStatus::RollbackDone {
                    info!(
                        transfer_id = req.transfer_id,
                        scene = req.scene,
                        "Empty rollback recorded for unknown transfer"
                    );
                    return Ok(());
                }
                // Transfer created concurrently; roll back what it wrote
                saga
            }
        };
        self.rollback_saga(&saga).await
    }

    /// Drive `saga` to ROLLBACK_DONE. Errors propagate; the saga stays in
    /// ROLLBACK_DOING for a retry or the inspection sweep.
    pub async fn rollback_saga(&self, saga: &SagaState) -> Result<(), TransferError> {
        if saga.status == SagaStatus::RollbackDone {
            return Ok(());
        }
        if saga.status != SagaStatus::RollbackDoing
            && !self
                .sagas
                .mark_rollback_doing(saga.transfer_id, saga.scene)
                .await?
        {
            // Reached ROLLBACK_DONE in the meantime
            return Ok(());
        }

        self.compensate(saga).await?;

        self.sagas
            .transition(
                saga.transfer_id,
                saga.scene,
                SagaStatus::RollbackDoing,
                SagaStatus::RollbackDone,
            )
            .await?;
        info!(
            transfer_id = saga.transfer_id,
            scene = saga.scene,
            "Transfer rolled back"
        );
        Ok(())
    }

    /// Best-effort rollback right after a failed forward step.
    ///
    /// Only claims sagas still in DOING. Failures are logged and returned for
    /// reporting only; the saga is left for the inspection sweep.
    pub async fn fast_rollback(&self, saga: &SagaState) -> Result<(), TransferError> {
        let result = self.try_fast_rollback(saga).await;
        if let Err(e) = &result {
            warn!(
                transfer_id = saga.transfer_id,
                scene = saga.scene,
                error = %e,
                "Fast rollback failed, left for inspection"
            );
        }
        result
    }

    async fn try_fast_rollback(&self, saga: &SagaState) -> Result<(), TransferError> {
        if !self
            .sagas
            .transition(
                saga.transfer_id,
                saga.scene,
                SagaStatus::Doing,
                SagaStatus::RollbackDoing,
            )
            .await?
        {
            return Ok(());
        }

        self.compensate(saga).await?;

        self.sagas
            .transition(
                saga.transfer_id,
                saga.scene,
                SagaStatus::RollbackDoing,
                SagaStatus::RollbackDone,
            )
            .await?;
        info!(
            transfer_id = saga.transfer_id,
            scene = saga.scene,
            "Transfer rolled back after failure"
        );
        Ok(())
    }

    /// Apply the compensating leg for every forward leg of `saga`
    pub async fn compensate(&self, saga: &SagaState) -> Result<(), TransferError> {
        for leg in &saga.to_legs {
            self.compensate_leg(saga, leg, LegDirection::Deduct).await?;
        }
        for leg in &saga.from_legs {
            self.compensate_leg(saga, leg, LegDirection::Increase).await?;
        }
        Ok(())
    }

    async fn compensate_leg(
        &self,
        saga: &SagaState,
        leg: &TransferLeg,
        direction: LegDirection,
    ) -> Result<(), TransferError> {
        let comment = format!("rollback {}", saga.leg_comment(leg));
        self.ledger
            .apply(LegOp {
                transfer_id: saga.transfer_id,
                scene: saga.scene,
                leg,
                direction,
                status: LegStatus::Rollback,
                comment: &comment,
            })
            .await
    }
}
