//! In-process storage backend
//!
//! Mirrors the relational layout: one lock-protected "database" per
//! `db_index`, rows keyed by `(table_index, natural key)`. A [`LedgerTx`]
//! holds its database lock until commit or drop and restores a snapshot when
//! dropped uncommitted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::EngineConfig;
use crate::core_types::{Amount, AssetType, HolderId, Scene, TimestampMs, TransferId, now_ms};
use crate::router::{Routing, ShardHandle};
use crate::transfer::state::{LegStatus, SagaStatus};
use crate::transfer::types::{BalanceRow, RecordEntry, RecordFilter, RecordKey, SagaState};

use super::{LedgerStore, LedgerTx, NewRecord, StoreError};

type TableIndex = u32;

#[derive(Debug, Default, Clone)]
struct MemoryDb {
    balances: HashMap<(TableIndex, HolderId, AssetType), BalanceRow>,
    records: HashMap<(TableIndex, RecordKey), RecordEntry>,
    sagas: HashMap<(TableIndex, TransferId, Scene), SagaState>,
}

#[inline]
fn table(shard: ShardHandle) -> TableIndex {
    shard.table_index.unwrap_or(0)
}

pub struct MemoryStore {
    routing: Routing,
    dbs: Vec<Arc<Mutex<MemoryDb>>>,
    next_id: Arc<AtomicI64>,
    failing_increase: Arc<StdMutex<HashSet<HolderId>>>,
    failing_saga_update: StdMutex<HashSet<TransferId>>,
}

impl MemoryStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_routing(Routing::from_config(config))
    }

    pub fn with_routing(routing: Routing) -> Self {
        let dbs = (0..routing.db_count)
            .map(|_| Arc::new(Mutex::new(MemoryDb::default())))
            .collect();
        Self {
            routing,
            dbs,
            next_id: Arc::new(AtomicI64::new(1)),
            failing_increase: Arc::new(StdMutex::new(HashSet::new())),
            failing_saga_update: StdMutex::new(HashSet::new()),
        }
    }

    /// Fault injection: make every increase on `holder_id` fail with a
    /// backend error until cleared.
    pub fn set_fail_increase(&self, holder_id: HolderId, fail: bool) {
        let mut failing = self
            .failing_increase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fail {
            failing.insert(holder_id);
        } else {
            failing.remove(&holder_id);
        }
    }

    /// Fault injection: make every saga status CAS of `transfer_id` fail
    /// with a backend error until cleared.
    pub fn set_fail_saga_update(&self, transfer_id: TransferId, fail: bool) {
        let mut failing = self
            .failing_saga_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if fail {
            failing.insert(transfer_id);
        } else {
            failing.remove(&transfer_id);
        }
    }

    fn saga_update_fails(&self, transfer_id: TransferId) -> bool {
        self.failing_saga_update
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&transfer_id)
    }

    /// Every record written for a transfer, in insertion order
    pub async fn records_for_transfer(&self, transfer_id: TransferId) -> Vec<RecordEntry> {
        let mut out = Vec::new();
        for db in &self.dbs {
            let db = db.lock().await;
            out.extend(
                db.records
                    .values()
                    .filter(|r| r.key.transfer_id == transfer_id)
                    .cloned(),
            );
        }
        out.sort_by_key(|r| r.id);
        out
    }

    fn db(&self, shard: ShardHandle) -> Result<&Arc<Mutex<MemoryDb>>, StoreError> {
        self.dbs
            .get(shard.db_index)
            .ok_or_else(|| StoreError::Backend(format!("no database for shard {}", shard)))
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_balances(
        &self,
        holder_id: HolderId,
    ) -> Result<HashMap<AssetType, Amount>, StoreError> {
        let shard = self.routing.balance.route(holder_id);
        let db = self.db(shard)?.lock().await;
        Ok(db
            .balances
            .iter()
            .filter(|((t, h, _), _)| *t == table(shard) && *h == holder_id)
            .map(|((_, _, asset), row)| (*asset, row.amount))
            .collect())
    }

    async fn get_balance(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<Option<BalanceRow>, StoreError> {
        let shard = self.routing.balance.route(holder_id);
        let db = self.db(shard)?.lock().await;
        Ok(db
            .balances
            .get(&(table(shard), holder_id, asset_type))
            .cloned())
    }

    async fn insert_balance(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<BalanceRow, StoreError> {
        let shard = self.routing.balance.route(holder_id);
        let mut db = self.db(shard)?.lock().await;
        let key = (table(shard), holder_id, asset_type);
        if db.balances.contains_key(&key) {
            return Err(StoreError::DuplicateKey);
        }
        let now = now_ms();
        let row = BalanceRow {
            id: self.next_id(),
            holder_id,
            asset_type,
            amount: 0,
            created_at: now,
            updated_at: now,
        };
        db.balances.insert(key, row.clone());
        Ok(row)
    }

    async fn get_record(&self, key: &RecordKey) -> Result<Option<RecordEntry>, StoreError> {
        let shard = self.routing.record.route(key.holder_id);
        let db = self.db(shard)?.lock().await;
        Ok(db.records.get(&(table(shard), *key)).cloned())
    }

    async fn last_record(
        &self,
        holder_id: HolderId,
        filter: &RecordFilter,
    ) -> Result<Option<RecordEntry>, StoreError> {
        let shard = self.routing.record.route(holder_id);
        let db = self.db(shard)?.lock().await;
        Ok(db
            .records
            .iter()
            .filter(|((t, key), rec)| {
                *t == table(shard)
                    && key.holder_id == holder_id
                    && rec.status == LegStatus::Normal
                    && filter.matches(key)
            })
            .map(|(_, rec)| rec)
            .max_by_key(|rec| rec.id)
            .cloned())
    }

    async fn begin(&self, holder_id: HolderId) -> Result<Box<dyn LedgerTx>, StoreError> {
        let record_shard = self.routing.record.route(holder_id);
        let balance_shard = self.routing.balance.route(holder_id);
        if record_shard.db_index != balance_shard.db_index {
            return Err(StoreError::Backend(format!(
                "record shard {} and balance shard {} on different databases",
                record_shard, balance_shard
            )));
        }
        let guard = self.db(record_shard)?.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            snapshot: Some(snapshot),
            record_table: table(record_shard),
            balance_table: table(balance_shard),
            next_id: self.next_id.clone(),
            failing_increase: self.failing_increase.clone(),
        }))
    }

    async fn get_saga(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<Option<SagaState>, StoreError> {
        let shard = self.routing.state.route(transfer_id);
        let db = self.db(shard)?.lock().await;
        Ok(db.sagas.get(&(table(shard), transfer_id, scene)).cloned())
    }

    async fn insert_saga(&self, state: &SagaState) -> Result<SagaState, StoreError> {
        let shard = self.routing.state.route(state.transfer_id);
        let mut db = self.db(shard)?.lock().await;
        let key = (table(shard), state.transfer_id, state.scene);
        if db.sagas.contains_key(&key) {
            return Err(StoreError::DuplicateKey);
        }
        let now = now_ms();
        let mut row = state.clone();
        row.id = self.next_id();
        row.created_at = now;
        row.updated_at = now;
        db.sagas.insert(key, row.clone());
        Ok(row)
    }

    async fn update_saga_status(
        &self,
        transfer_id: TransferId,
        scene: Scene,
        from: SagaStatus,
        to: SagaStatus,
    ) -> Result<bool, StoreError> {
        if self.saga_update_fails(transfer_id) {
            return Err(StoreError::Backend(format!(
                "injected saga update failure for transfer {}",
                transfer_id
            )));
        }
        let shard = self.routing.state.route(transfer_id);
        let mut db = self.db(shard)?.lock().await;
        match db.sagas.get_mut(&(table(shard), transfer_id, scene)) {
            Some(saga) if saga.status == from => {
                saga.status = to;
                saga.updated_at = now_ms();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_rollback_doing(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<bool, StoreError> {
        let shard = self.routing.state.route(transfer_id);
        let mut db = self.db(shard)?.lock().await;
        match db.sagas.get_mut(&(table(shard), transfer_id, scene)) {
            Some(saga) if saga.status != SagaStatus::RollbackDone => {
                saga.status = SagaStatus::RollbackDoing;
                saga.updated_at = now_ms();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale_sagas(&self, deadline: TimestampMs) -> Result<Vec<SagaState>, StoreError> {
        let mut out = Vec::new();
        for shard in self.routing.state.all_shards() {
            let db = self.db(shard)?.lock().await;
            out.extend(
                db.sagas
                    .iter()
                    .filter(|((t, _, _), saga)| {
                        *t == table(shard)
                            && saga.status.needs_inspection()
                            && saga.updated_at <= deadline
                    })
                    .map(|(_, saga)| saga.clone()),
            );
        }
        out.sort_by_key(|s| s.updated_at);
        Ok(out)
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryDb>,
    /// Pre-transaction image, restored on drop unless committed
    snapshot: Option<MemoryDb>,
    record_table: TableIndex,
    balance_table: TableIndex,
    next_id: Arc<AtomicI64>,
    failing_increase: Arc<StdMutex<HashSet<HolderId>>>,
}

impl MemoryTx {
    fn balance_mut(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Option<&mut BalanceRow> {
        self.guard
            .balances
            .get_mut(&(self.balance_table, holder_id, asset_type))
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn insert_record(&mut self, record: &NewRecord) -> Result<(), StoreError> {
        let key = (self.record_table, record.key);
        if self.guard.records.contains_key(&key) {
            return Err(StoreError::DuplicateKey);
        }
        let now = now_ms();
        let entry = RecordEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key: record.key,
            status: record.status,
            amount: record.amount,
            comment: record.comment.clone(),
            created_at: now,
            updated_at: now,
        };
        self.guard.records.insert(key, entry);
        Ok(())
    }

    async fn update_record_status(
        &mut self,
        key: &RecordKey,
        from: LegStatus,
        to: LegStatus,
    ) -> Result<bool, StoreError> {
        match self.guard.records.get_mut(&(self.record_table, *key)) {
            Some(entry) if entry.status == from => {
                entry.status = to;
                entry.updated_at = now_ms();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deduct(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
        delta: Amount,
        guarded: bool,
    ) -> Result<bool, StoreError> {
        match self.balance_mut(holder_id, asset_type) {
            Some(row) if !guarded || row.amount - delta >= 0 => {
                row.amount -= delta;
                row.updated_at = now_ms();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increase(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
        delta: Amount,
    ) -> Result<bool, StoreError> {
        let injected = self
            .failing_increase
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&holder_id);
        if injected {
            return Err(StoreError::Backend(format!(
                "injected increase failure for holder {}",
                holder_id
            )));
        }
        match self.balance_mut(holder_id, asset_type) {
            Some(row) => {
                row.amount += delta;
                row.updated_at = now_ms();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.snapshot = None;
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            debug!("memory transaction dropped uncommitted, restoring snapshot");
            *self.guard = snapshot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::state::LegDirection;

    fn store() -> MemoryStore {
        MemoryStore::new(&EngineConfig {
            db_count: 2,
            record_split_num: 3,
            balance_split_num: 2,
            state_split_num: 4,
            ..Default::default()
        })
    }

    fn key(holder_id: HolderId) -> RecordKey {
        RecordKey {
            holder_id,
            transfer_id: 1,
            asset_type: 1,
            scene: 1,
            direction: LegDirection::Deduct,
            change_type: 1,
        }
    }

    #[tokio::test]
    async fn test_insert_balance_duplicate() {
        let store = store();
        store.insert_balance(42, 1).await.unwrap();
        assert_eq!(
            store.insert_balance(42, 1).await,
            Err(StoreError::DuplicateKey)
        );
        assert!(store.insert_balance(42, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_guarded_deduct() {
        let store = store();
        store.insert_balance(42, 1).await.unwrap();

        let mut tx = store.begin(42).await.unwrap();
        assert!(tx.increase(42, 1, 10).await.unwrap());
        assert!(!tx.deduct(42, 1, 11, true).await.unwrap());
        assert!(tx.deduct(42, 1, 10, true).await.unwrap());
        assert!(tx.deduct(42, 1, 5, false).await.unwrap());
        tx.commit().await.unwrap();
        drop(tx);

        let row = store.get_balance(42, 1).await.unwrap().unwrap();
        assert_eq!(row.amount, -5);
    }

    #[tokio::test]
    async fn test_dropped_tx_rolls_back() {
        let store = store();
        store.insert_balance(42, 1).await.unwrap();

        {
            let mut tx = store.begin(42).await.unwrap();
            tx.insert_record(&NewRecord {
                key: key(42),
                status: LegStatus::Normal,
                amount: 3,
                comment: String::new(),
            })
            .await
            .unwrap();
            assert!(tx.increase(42, 1, 3).await.unwrap());
        }

        assert!(store.get_record(&key(42)).await.unwrap().is_none());
        assert_eq!(store.get_balance(42, 1).await.unwrap().unwrap().amount, 0);
    }

    #[tokio::test]
    async fn test_injected_saga_update_failure() {
        let store = store();
        let mut saga = SagaState::empty_rollback(78, 1);
        saga.status = SagaStatus::Doing;
        store.insert_saga(&saga).await.unwrap();

        store.set_fail_saga_update(78, true);
        assert!(matches!(
            store
                .update_saga_status(78, 1, SagaStatus::Doing, SagaStatus::Success)
                .await,
            Err(StoreError::Backend(_))
        ));

        store.set_fail_saga_update(78, false);
        assert!(
            store
                .update_saga_status(78, 1, SagaStatus::Doing, SagaStatus::Success)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_saga_cas() {
        let store = store();
        let saga = store
            .insert_saga(&SagaState::empty_rollback(77, 1))
            .await
            .unwrap();
        assert!(saga.id > 0);
        assert_eq!(
            store.insert_saga(&saga).await,
            Err(StoreError::DuplicateKey)
        );
        assert!(!store.mark_rollback_doing(77, 1).await.unwrap());
        assert!(
            !store
                .update_saga_status(77, 1, SagaStatus::Doing, SagaStatus::Success)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_injected_increase_failure() {
        let store = store();
        store.insert_balance(42, 1).await.unwrap();
        store.set_fail_increase(42, true);
        let mut tx = store.begin(42).await.unwrap();
        assert!(matches!(
            tx.increase(42, 1, 1).await,
            Err(StoreError::Backend(_))
        ));
        drop(tx);

        store.set_fail_increase(42, false);
        let mut tx = store.begin(42).await.unwrap();
        assert!(tx.increase(42, 1, 1).await.unwrap());
    }
}
