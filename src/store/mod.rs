//! Storage adapters
//!
//! The transfer core talks to storage only through [`LedgerStore`] and
//! [`LedgerTx`]. Implementations must provide row-level atomic conditional
//! updates, unique constraints on the documented keys, and local ACID
//! transactions on one database.
//!
//! - [`postgres::PgStore`]: sqlx/PostgreSQL, one pool per physical database
//! - [`memory::MemoryStore`]: in-process, same row semantics

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::core_types::{Amount, AssetType, HolderId, Scene, TimestampMs, TransferId};
use crate::transfer::state::{LegStatus, SagaStatus};
use crate::transfer::types::{BalanceRow, RecordEntry, RecordFilter, RecordKey, SagaState};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Unique constraint violated by a concurrent insert
    #[error("duplicate key")]
    DuplicateKey,

    #[error("storage backend error: {0}")]
    Backend(String),

    /// Row exists but cannot be decoded
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::DuplicateKey,
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Ledger record to insert
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub key: RecordKey,
    pub status: LegStatus,
    pub amount: Amount,
    pub comment: String,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // === Balances (routed by holder id) ===

    async fn get_balances(
        &self,
        holder_id: HolderId,
    ) -> Result<HashMap<AssetType, Amount>, StoreError>;

    async fn get_balance(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<Option<BalanceRow>, StoreError>;

    /// Insert a zero row. `DuplicateKey` if another writer won the race.
    async fn insert_balance(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<BalanceRow, StoreError>;

    // === Records (routed by holder id) ===

    async fn get_record(&self, key: &RecordKey) -> Result<Option<RecordEntry>, StoreError>;

    /// Newest NORMAL record of a holder matching `filter`
    async fn last_record(
        &self,
        holder_id: HolderId,
        filter: &RecordFilter,
    ) -> Result<Option<RecordEntry>, StoreError>;

    /// Open a local transaction on the database owning `holder_id`'s
    /// record and balance rows
    async fn begin(&self, holder_id: HolderId) -> Result<Box<dyn LedgerTx>, StoreError>;

    // === Saga state (routed by transfer id) ===

    async fn get_saga(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<Option<SagaState>, StoreError>;

    /// `DuplicateKey` if a saga for (transfer_id, scene) already exists
    async fn insert_saga(&self, state: &SagaState) -> Result<SagaState, StoreError>;

    /// CAS on status. Returns false when the current status is not `from`.
    async fn update_saga_status(
        &self,
        transfer_id: TransferId,
        scene: Scene,
        from: SagaStatus,
        to: SagaStatus,
    ) -> Result<bool, StoreError>;

    /// Any status except ROLLBACK_DONE -> ROLLBACK_DOING
    async fn mark_rollback_doing(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<bool, StoreError>;

    /// Sagas with `status <= HALF_SUCCESS` and `updated_at <= deadline`,
    /// across every database and table
    async fn find_stale_sagas(&self, deadline: TimestampMs) -> Result<Vec<SagaState>, StoreError>;
}

/// One local transaction. Dropping without `commit` rolls back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn insert_record(&mut self, record: &NewRecord) -> Result<(), StoreError>;

    /// CAS on record status. Returns false when the current status is not `from`.
    async fn update_record_status(
        &mut self,
        key: &RecordKey,
        from: LegStatus,
        to: LegStatus,
    ) -> Result<bool, StoreError>;

    /// `amount -= delta`; with `guarded` only where the result stays >= 0.
    /// Returns whether a row was updated.
    async fn deduct(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
        delta: Amount,
        guarded: bool,
    ) -> Result<bool, StoreError>;

    /// `amount += delta`. Returns whether a row was updated.
    async fn increase(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
        delta: Amount,
    ) -> Result<bool, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}
