//! Leg execution against the ledger record table
//!
//! A leg is one holder's balance mutation plus the record that makes it
//! idempotent. Record and balance are written in the same local transaction,
//! so a leg is either fully applied or not at all.
//!
//! Forward legs write a NORMAL record; compensation flips it to ROLLBACK and
//! moves the amount back. A compensation that finds no forward record writes
//! an EMPTY_ROLLBACK marker instead, which blocks the forward leg forever.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::core_types::{HolderId, Scene, TransferId};
use crate::official::OfficialRange;
use crate::store::{LedgerStore, NewRecord};

use super::balance::BalanceStore;
use super::error::TransferError;
use super::state::{LegDirection, LegStatus};
use super::types::{RecordEntry, RecordFilter, RecordKey, TransferLeg};

/// One leg to apply
#[derive(Debug, Clone, Copy)]
pub struct LegOp<'a> {
    pub transfer_id: TransferId,
    pub scene: Scene,
    pub leg: &'a TransferLeg,
    /// Balance movement performed now
    pub direction: LegDirection,
    /// NORMAL for forward legs, ROLLBACK for compensation
    pub status: LegStatus,
    pub comment: &'a str,
}

impl LegOp<'_> {
    /// Compensation is keyed by the direction of the leg it undoes
    pub fn record_key(&self) -> RecordKey {
        RecordKey {
            holder_id: self.leg.holder_id,
            transfer_id: self.transfer_id,
            asset_type: self.leg.asset_type,
            scene: self.scene,
            direction: self.direction.record_direction(self.status),
            change_type: self.leg.change_type,
        }
    }

    fn new_record(&self, status: LegStatus) -> NewRecord {
        NewRecord {
            key: self.record_key(),
            status,
            amount: self.leg.amount,
            comment: self.comment.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RecordLedger {
    store: Arc<dyn LedgerStore>,
    balances: BalanceStore,
    official: OfficialRange,
}

impl RecordLedger {
    pub fn new(store: Arc<dyn LedgerStore>, official: OfficialRange) -> Self {
        Self {
            balances: BalanceStore::new(store.clone()),
            store,
            official,
        }
    }

    pub fn balances(&self) -> &BalanceStore {
        &self.balances
    }

    /// Apply one leg. Idempotent: replaying a leg already in the requested
    /// status returns `Ok` without touching the balance.
    pub async fn apply(&self, op: LegOp<'_>) -> Result<(), TransferError> {
        let holder_id = op.leg.holder_id;
        let asset_type = op.leg.asset_type;
        let key = op.record_key();

        // Store reads must happen before the transaction takes the shard
        self.balances.get_or_create(holder_id, asset_type).await?;
        let existing = self.store.get_record(&key).await?;

        if let Some(record) = &existing
            && record.status == op.status
        {
            debug!(
                transfer_id = op.transfer_id,
                holder_id,
                status = %op.status,
                "Leg already applied"
            );
            return Ok(());
        }

        let mut tx = self.store.begin(holder_id).await?;

        match &existing {
            None if op.status == LegStatus::Rollback => {
                // Forward leg never ran; block it from running later
                tx.insert_record(&op.new_record(LegStatus::EmptyRollback))
                    .await?;
                tx.commit().await?;
                debug!(
                    transfer_id = op.transfer_id,
                    holder_id, "Empty rollback recorded"
                );
                return Ok(());
            }
            None => {
                tx.insert_record(&op.new_record(LegStatus::Normal)).await?;
            }
            Some(record) => {
                if op.status == LegStatus::Normal && record.status.is_compensated() {
                    warn!(
                        transfer_id = op.transfer_id,
                        holder_id,
                        record_status = %record.status,
                        "Forward leg after compensation"
                    );
                    return Err(TransferError::state_mutation(format!(
                        "leg of holder {} already {}",
                        holder_id, record.status
                    )));
                }
                if !tx
                    .update_record_status(&key, LegStatus::Normal, op.status)
                    .await?
                {
                    // Lost the race to another compensator
                    debug!(
                        transfer_id = op.transfer_id,
                        holder_id, "Record status changed concurrently"
                    );
                    return Ok(());
                }
            }
        }

        if op.leg.amount == 0 {
            tx.commit().await?;
            return Ok(());
        }

        match op.direction {
            LegDirection::Deduct => {
                let guarded =
                    op.status == LegStatus::Normal && !self.official.contains(holder_id);
                BalanceStore::deduct(tx.as_mut(), holder_id, asset_type, op.leg.amount, guarded)
                    .await?;
            }
            LegDirection::Increase => {
                BalanceStore::increase(tx.as_mut(), holder_id, asset_type, op.leg.amount).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Newest NORMAL record of `holder_id` matching `filter`
    pub async fn last_record(
        &self,
        holder_id: HolderId,
        filter: &RecordFilter,
    ) -> Result<Option<RecordEntry>, TransferError> {
        Ok(self.store.last_record(holder_id, filter).await?)
    }
}
