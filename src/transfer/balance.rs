//! Balance rows
//!
//! Reads go straight to the store. Mutations only happen inside a leg
//! transaction and are single conditional UPDATEs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::core_types::{Amount, AssetType, HolderId};
use crate::store::{LedgerStore, LedgerTx, StoreError};

use super::error::TransferError;
use super::types::BalanceRow;

#[derive(Clone)]
pub struct BalanceStore {
    store: Arc<dyn LedgerStore>,
}

impl BalanceStore {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Every asset amount of a holder; empty when the holder has no rows
    pub async fn get_amounts(
        &self,
        holder_id: HolderId,
    ) -> Result<HashMap<AssetType, Amount>, TransferError> {
        Ok(self.store.get_balances(holder_id).await?)
    }

    /// Zero when no row exists
    pub async fn get_amount(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<Amount, TransferError> {
        Ok(self
            .store
            .get_balance(holder_id, asset_type)
            .await?
            .map(|row| row.amount)
            .unwrap_or(0))
    }

    /// Ensure a balance row exists, creating a zero row if needed.
    ///
    /// A concurrent creator winning the unique key is not an error; the row
    /// is re-read.
    pub async fn get_or_create(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<BalanceRow, TransferError> {
        if let Some(row) = self.store.get_balance(holder_id, asset_type).await? {
            return Ok(row);
        }

        match self.store.insert_balance(holder_id, asset_type).await {
            Ok(row) => {
                debug!(holder_id, asset_type, "Balance row created");
                Ok(row)
            }
            Err(StoreError::DuplicateKey) => self
                .store
                .get_balance(holder_id, asset_type)
                .await?
                .ok_or_else(|| {
                    TransferError::state_mutation(format!(
                        "balance row {}/{} vanished after duplicate insert",
                        holder_id, asset_type
                    ))
                }),
            Err(e) => Err(e.into()),
        }
    }

    /// Deduct inside `tx`. With `guarded` the balance may not go negative.
    pub async fn deduct(
        tx: &mut dyn LedgerTx,
        holder_id: HolderId,
        asset_type: AssetType,
        amount: Amount,
        guarded: bool,
    ) -> Result<(), TransferError> {
        if !tx.deduct(holder_id, asset_type, amount, guarded).await? {
            return Err(TransferError::InsufficientAmount);
        }
        Ok(())
    }

    pub async fn increase(
        tx: &mut dyn LedgerTx,
        holder_id: HolderId,
        asset_type: AssetType,
        amount: Amount,
    ) -> Result<(), TransferError> {
        if !tx.increase(holder_id, asset_type, amount).await? {
            return Err(TransferError::state_mutation(format!(
                "balance row {}/{} missing on increase",
                holder_id, asset_type
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::MemoryStore;

    fn balances() -> BalanceStore {
        BalanceStore::new(Arc::new(MemoryStore::new(&EngineConfig::default())))
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let b = balances();
        let first = b.get_or_create(5_000_001, 1).await.unwrap();
        let second = b.get_or_create(5_000_001, 1).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.amount, 0);
    }

    #[tokio::test]
    async fn test_missing_row_reads_as_zero() {
        let b = balances();
        assert_eq!(b.get_amount(5_000_001, 1).await.unwrap(), 0);
        assert!(b.get_amounts(5_000_001).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guarded_deduct_maps_to_insufficient() {
        let store = Arc::new(MemoryStore::new(&EngineConfig::default()));
        let b = BalanceStore::new(store.clone());
        b.get_or_create(5_000_001, 1).await.unwrap();

        let mut tx = store.begin(5_000_001).await.unwrap();
        BalanceStore::increase(tx.as_mut(), 5_000_001, 1, 5).await.unwrap();
        assert_eq!(
            BalanceStore::deduct(tx.as_mut(), 5_000_001, 1, 6, true).await,
            Err(TransferError::InsufficientAmount)
        );
        BalanceStore::deduct(tx.as_mut(), 5_000_001, 1, 5, true)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        drop(tx);

        assert_eq!(b.get_amount(5_000_001, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_increase_without_row_is_state_mutation() {
        let store = Arc::new(MemoryStore::new(&EngineConfig::default()));
        let mut tx = store.begin(5_000_009).await.unwrap();
        let err = BalanceStore::increase(tx.as_mut(), 5_000_009, 1, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::StateMutation(_)));
    }
}
