//! Transfer Coordinator
//!
//! Public entry point of the engine. Validates and meshes requests, persists
//! the saga, then hands it to the executor. Owns its configuration for its
//! whole lifetime; there is no process-global state.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ConfigError, EngineConfig};
use crate::core_types::{Amount, AssetType, HolderId, Scene, TimestampMs, TransferId};
use crate::official::OfficialRange;
use crate::store::LedgerStore;

use super::error::TransferError;
use super::executor::{ErrorHook, SagaExecutor};
use super::inspection::InspectionSweeper;
use super::record::RecordLedger;
use super::rollback::Compensator;
use super::saga::SagaRepository;
use super::state::SagaStatus;
use super::types::{RecordEntry, RecordFilter, RollbackRequest, SagaState, TransferRequest};
use super::validation::validate_transfer;

#[derive(Clone)]
pub struct TransferCoordinator {
    config: EngineConfig,
    official: OfficialRange,
    ledger: RecordLedger,
    sagas: SagaRepository,
    compensator: Compensator,
    executor: SagaExecutor,
}

impl TransferCoordinator {
    pub fn new(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let official = OfficialRange::from_config(&config)?;

        let ledger = RecordLedger::new(store.clone(), official);
        let sagas = SagaRepository::new(store);
        let compensator = Compensator::new(ledger.clone(), sagas.clone());
        let executor = SagaExecutor::new(ledger.clone(), sagas.clone(), compensator.clone());

        Ok(Self {
            config,
            official,
            ledger,
            sagas,
            compensator,
            executor,
        })
    }

    /// Install a callback for errors raised after the caller already got
    /// its answer
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.executor = self.executor.with_error_hook(hook);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn official(&self) -> &OfficialRange {
        &self.official
    }

    /// Execute a transfer. Safe to retry with the same request: a retry
    /// resumes the persisted saga and never re-applies a leg.
    pub async fn transfer(&self, req: TransferRequest) -> Result<(), TransferError> {
        validate_transfer(&req, &self.official)?;

        let mut req = req;
        self.official.mesh_request(&mut req);

        let saga = self
            .sagas
            .get_or_create(&SagaState::from_request(&req))
            .await?;

        match saga.status {
            SagaStatus::Success | SagaStatus::HalfSuccess => {
                debug!(
                    transfer_id = saga.transfer_id,
                    scene = saga.scene,
                    status = %saga.status,
                    "Transfer already applied"
                );
                Ok(())
            }
            SagaStatus::RollbackDoing | SagaStatus::RollbackDone => {
                info!(
                    transfer_id = saga.transfer_id,
                    scene = saga.scene,
                    status = %saga.status,
                    "Transfer rejected, already rolled back"
                );
                Err(TransferError::AlreadyRolledBack)
            }
            SagaStatus::Doing => {
                // Retries run the legs persisted by the first attempt
                self.executor.execute(saga, req.use_half_success).await
            }
        }
    }

    /// Undo a transfer, or block it from ever running if it is unknown
    pub async fn rollback(&self, req: RollbackRequest) -> Result<(), TransferError> {
        if req.transfer_id <= 0 || req.scene <= 0 {
            return Err(TransferError::InvalidParams(format!(
                "invalid transfer_id {} or scene {}",
                req.transfer_id, req.scene
            )));
        }
        self.compensator.rollback(req).await
    }

    /// Sweep sagas last updated at or before `deadline`
    pub async fn inspect(&self, deadline: TimestampMs) -> Vec<TransferError> {
        InspectionSweeper::new(
            self.sagas.clone(),
            self.executor.clone(),
            self.compensator.clone(),
        )
        .inspect(deadline)
        .await
    }

    /// Every asset amount of a holder
    pub async fn get_balance(
        &self,
        holder_id: HolderId,
    ) -> Result<HashMap<AssetType, Amount>, TransferError> {
        self.ledger.balances().get_amounts(holder_id).await
    }

    pub async fn get_balance_by_asset(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<Amount, TransferError> {
        self.ledger.balances().get_amount(holder_id, asset_type).await
    }

    /// Newest NORMAL ledger record of a holder
    pub async fn last_record(
        &self,
        holder_id: HolderId,
        filter: &RecordFilter,
    ) -> Result<Option<RecordEntry>, TransferError> {
        self.ledger.last_record(holder_id, filter).await
    }

    pub async fn get_saga(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<Option<SagaState>, TransferError> {
        self.sagas.get(transfer_id, scene).await
    }
}
