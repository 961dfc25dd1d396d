//! Forward saga execution
//!
//! ```text
//! DOING --deduct all--> (sync)  --increase all--> SUCCESS
//!                  \--> (half)  HALF_SUCCESS --background increases--> SUCCESS
//! any forward or status-update failure in DOING --> fast rollback --> ROLLBACK_DONE
//! ```
//!
//! Deductions always run first, so no destination is credited before every
//! source has paid.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::core_types::{Scene, TransferId};

use super::error::TransferError;
use super::record::{LegOp, RecordLedger};
use super::rollback::Compensator;
use super::saga::SagaRepository;
use super::state::{LegDirection, LegStatus, SagaStatus};
use super::types::SagaState;

/// Receives errors that cannot be returned to the caller: failures of
/// background increases after a half-success return, and failures of the
/// fast rollback itself
pub type ErrorHook = Arc<dyn Fn(TransferId, Scene, &TransferError) + Send + Sync>;

#[derive(Clone)]
pub struct SagaExecutor {
    ledger: RecordLedger,
    sagas: SagaRepository,
    compensator: Compensator,
    hook: Option<ErrorHook>,
}

impl SagaExecutor {
    pub fn new(ledger: RecordLedger, sagas: SagaRepository, compensator: Compensator) -> Self {
        Self {
            ledger,
            sagas,
            compensator,
            hook: None,
        }
    }

    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Run a DOING saga forward using its persisted legs
    pub async fn execute(
        &self,
        saga: SagaState,
        use_half_success: bool,
    ) -> Result<(), TransferError> {
        if let Err(e) = self.run_deductions(&saga).await {
            warn!(
                transfer_id = saga.transfer_id,
                scene = saga.scene,
                error = %e,
                "Deduction failed, rolling back"
            );
            self.rollback_after_failure(&saga).await;
            return Err(e);
        }

        if use_half_success {
            if !self.leave_doing(&saga, SagaStatus::HalfSuccess).await? {
                return self.resolve_lost_cas(&saga).await;
            }

            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.complete_half_success(&saga).await {
                    error!(
                        transfer_id = saga.transfer_id,
                        scene = saga.scene,
                        error = %e,
                        "Background increase failed, left for inspection"
                    );
                    this.report(saga.transfer_id, saga.scene, &e);
                }
            });
            return Ok(());
        }

        if let Err(e) = self.run_increases(&saga).await {
            warn!(
                transfer_id = saga.transfer_id,
                scene = saga.scene,
                error = %e,
                "Increase failed, rolling back"
            );
            self.rollback_after_failure(&saga).await;
            return Err(e);
        }

        if !self.leave_doing(&saga, SagaStatus::Success).await? {
            return self.resolve_lost_cas(&saga).await;
        }

        info!(
            transfer_id = saga.transfer_id,
            scene = saga.scene,
            "Transfer succeeded"
        );
        Ok(())
    }

    /// Finish a HALF_SUCCESS saga: apply every increase, then SUCCESS.
    /// Never rolls back; the deductions are final.
    pub async fn complete_half_success(&self, saga: &SagaState) -> Result<(), TransferError> {
        self.run_increases(saga).await?;

        if !self
            .sagas
            .transition(
                saga.transfer_id,
                saga.scene,
                SagaStatus::HalfSuccess,
                SagaStatus::Success,
            )
            .await?
        {
            let current = self.sagas.reread(saga.transfer_id, saga.scene).await?;
            if current.status != SagaStatus::Success {
                return Err(TransferError::state_mutation(format!(
                    "half-success saga moved to {}",
                    current.status
                )));
            }
        }

        info!(
            transfer_id = saga.transfer_id,
            scene = saga.scene,
            "Half-success transfer completed"
        );
        Ok(())
    }

    async fn run_deductions(&self, saga: &SagaState) -> Result<(), TransferError> {
        for leg in &saga.from_legs {
            self.ledger
                .apply(LegOp {
                    transfer_id: saga.transfer_id,
                    scene: saga.scene,
                    leg,
                    direction: LegDirection::Deduct,
                    status: LegStatus::Normal,
                    comment: saga.leg_comment(leg),
                })
                .await?;
        }
        Ok(())
    }

    async fn run_increases(&self, saga: &SagaState) -> Result<(), TransferError> {
        for leg in &saga.to_legs {
            self.ledger
                .apply(LegOp {
                    transfer_id: saga.transfer_id,
                    scene: saga.scene,
                    leg,
                    direction: LegDirection::Increase,
                    status: LegStatus::Normal,
                    comment: saga.leg_comment(leg),
                })
                .await?;
        }
        Ok(())
    }

    /// CAS the saga out of DOING. `Ok(false)` means another writer got there
    /// first. A storage error triggers the fast rollback before returning.
    async fn leave_doing(&self, saga: &SagaState, to: SagaStatus) -> Result<bool, TransferError> {
        match self
            .sagas
            .transition(saga.transfer_id, saga.scene, SagaStatus::Doing, to)
            .await
        {
            Ok(won) => Ok(won),
            Err(e) => {
                warn!(
                    transfer_id = saga.transfer_id,
                    scene = saga.scene,
                    to = %to,
                    error = %e,
                    "Saga status update failed, rolling back"
                );
                self.rollback_after_failure(saga).await;
                Err(e)
            }
        }
    }

    /// A status CAS out of DOING found another writer first
    async fn resolve_lost_cas(&self, saga: &SagaState) -> Result<(), TransferError> {
        let current = match self.sagas.reread(saga.transfer_id, saga.scene).await {
            Ok(current) => current,
            Err(e) => {
                self.rollback_after_failure(saga).await;
                return Err(e);
            }
        };
        debug!(
            transfer_id = saga.transfer_id,
            status = %current.status,
            "Saga status changed concurrently"
        );
        match current.status {
            SagaStatus::Success | SagaStatus::HalfSuccess => Ok(()),
            SagaStatus::RollbackDone => Err(TransferError::state_mutation(
                "saga rolled back concurrently",
            )),
            SagaStatus::Doing | SagaStatus::RollbackDoing => {
                self.rollback_after_failure(saga).await;
                Err(TransferError::state_mutation(format!(
                    "saga moved to {} during execution",
                    current.status
                )))
            }
        }
    }

    /// The caller gets the original error; rollback failures only go to
    /// the log and the hook
    async fn rollback_after_failure(&self, saga: &SagaState) {
        if let Err(e) = self.compensator.fast_rollback(saga).await {
            self.report(saga.transfer_id, saga.scene, &e);
        }
    }

    fn report(&self, transfer_id: TransferId, scene: Scene, err: &TransferError) {
        if let Some(hook) = &self.hook {
            hook(transfer_id, scene, err);
        }
    }
}
