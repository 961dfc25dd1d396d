//! Saga state persistence
//!
//! Status changes are CAS updates; callers re-read on a lost CAS and decide
//! from the status they find.

use std::sync::Arc;

use tracing::{debug, error};

use crate::core_types::{Scene, TimestampMs, TransferId};
use crate::store::{LedgerStore, StoreError};

use super::error::TransferError;
use super::state::SagaStatus;
use super::types::SagaState;

#[derive(Clone)]
pub struct SagaRepository {
    store: Arc<dyn LedgerStore>,
}

impl SagaRepository {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn get(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<Option<SagaState>, TransferError> {
        Ok(self.store.get_saga(transfer_id, scene).await?)
    }

    /// Insert `state`, or return the saga a previous or concurrent call
    /// already persisted for the same (transfer_id, scene)
    pub async fn get_or_create(&self, state: &SagaState) -> Result<SagaState, TransferError> {
        if let Some(existing) = self.get(state.transfer_id, state.scene).await? {
            return Ok(existing);
        }
        self.insert_or_reread(state).await
    }

    /// Terminal ROLLBACK_DONE marker for a rollback of an unknown transfer
    pub async fn create_empty_rollback(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<SagaState, TransferError> {
        self.insert_or_reread(&SagaState::empty_rollback(transfer_id, scene))
            .await
    }

    async fn insert_or_reread(&self, state: &SagaState) -> Result<SagaState, TransferError> {
        match self.store.insert_saga(state).await {
            Ok(saga) => {
                debug!(
                    transfer_id = saga.transfer_id,
                    scene = saga.scene,
                    status = %saga.status,
                    "Saga created"
                );
                Ok(saga)
            }
            Err(StoreError::DuplicateKey) => self
                .get(state.transfer_id, state.scene)
                .await?
                .ok_or_else(|| {
                    error!(
                        transfer_id = state.transfer_id,
                        scene = state.scene,
                        "Saga not found after duplicate insert (data corruption?)"
                    );
                    TransferError::state_mutation("saga vanished after duplicate insert")
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// CAS `from -> to`. Returns false when the saga is not in `from`.
    pub async fn transition(
        &self,
        transfer_id: TransferId,
        scene: Scene,
        from: SagaStatus,
        to: SagaStatus,
    ) -> Result<bool, TransferError> {
        let moved = self
            .store
            .update_saga_status(transfer_id, scene, from, to)
            .await?;
        if moved {
            debug!(transfer_id, scene, from = %from, to = %to, "Saga transitioned");
        }
        Ok(moved)
    }

    /// Any non-terminal-rollback status -> ROLLBACK_DOING
    pub async fn mark_rollback_doing(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<bool, TransferError> {
        Ok(self.store.mark_rollback_doing(transfer_id, scene).await?)
    }

    /// Re-read after a lost CAS; a missing saga is a state mutation
    pub async fn reread(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<SagaState, TransferError> {
        self.get(transfer_id, scene).await?.ok_or_else(|| {
            error!(
                transfer_id,
                scene, "Saga not found after CAS failure (data corruption?)"
            );
            TransferError::state_mutation(format!("saga {}/{} not found", transfer_id, scene))
        })
    }

    /// Non-terminal sagas untouched since `deadline`
    pub async fn stale(&self, deadline: TimestampMs) -> Result<Vec<SagaState>, TransferError> {
        Ok(self.store.find_stale_sagas(deadline).await?)
    }
}
