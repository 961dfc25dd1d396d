//! Transfer core types

use serde::{Deserialize, Serialize};

use crate::core_types::{
    Amount, AssetType, ChangeType, HolderId, Scene, TimestampMs, TransferId,
};

use super::state::{LegDirection, LegStatus, SagaStatus};

/// One participant of a transfer: a single-holder, single-direction mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub holder_id: HolderId,
    pub asset_type: AssetType,
    pub amount: Amount,
    pub change_type: ChangeType,
    #[serde(default)]
    pub comment: String,
}

impl TransferLeg {
    pub fn new(
        holder_id: HolderId,
        asset_type: AssetType,
        amount: Amount,
        change_type: ChangeType,
    ) -> Self {
        Self {
            holder_id,
            asset_type,
            amount,
            change_type,
            comment: String::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// Transfer request from the embedding service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub transfer_id: TransferId,
    pub scene: Scene,
    /// Source legs, deducted first
    pub from: Vec<TransferLeg>,
    /// Destination legs, increased after every deduction committed
    pub to: Vec<TransferLeg>,
    /// Return once deductions commit; increases complete in the background
    #[serde(default)]
    pub use_half_success: bool,
    #[serde(default)]
    pub comment: String,
}

impl TransferRequest {
    pub fn new(
        transfer_id: TransferId,
        scene: Scene,
        from: Vec<TransferLeg>,
        to: Vec<TransferLeg>,
    ) -> Self {
        Self {
            transfer_id,
            scene,
            from,
            to,
            use_half_success: false,
            comment: String::new(),
        }
    }

    pub fn half_success(mut self) -> Self {
        self.use_half_success = true;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub transfer_id: TransferId,
    pub scene: Scene,
}

/// Durable saga record, one per (transfer_id, scene)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaState {
    pub id: i64,
    pub transfer_id: TransferId,
    pub scene: Scene,
    pub from_legs: Vec<TransferLeg>,
    pub to_legs: Vec<TransferLeg>,
    pub status: SagaStatus,
    pub comment: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl SagaState {
    /// Fresh saga in DOING for a validated, meshed request
    pub fn from_request(req: &TransferRequest) -> Self {
        Self {
            id: 0,
            transfer_id: req.transfer_id,
            scene: req.scene,
            from_legs: req.from.clone(),
            to_legs: req.to.clone(),
            status: SagaStatus::Doing,
            comment: req.comment.clone(),
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Terminal marker for a rollback that arrived before its transfer
    pub fn empty_rollback(transfer_id: TransferId, scene: Scene) -> Self {
        Self {
            id: 0,
            transfer_id,
            scene,
            from_legs: Vec::new(),
            to_legs: Vec::new(),
            status: SagaStatus::RollbackDone,
            comment: "empty rollback".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Comment recorded for a forward leg
    pub fn leg_comment<'a>(&'a self, leg: &'a TransferLeg) -> &'a str {
        if leg.comment.is_empty() {
            &self.comment
        } else {
            &leg.comment
        }
    }
}

/// Idempotency key of a ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub holder_id: HolderId,
    pub transfer_id: TransferId,
    pub asset_type: AssetType,
    pub scene: Scene,
    pub direction: LegDirection,
    pub change_type: ChangeType,
}

/// One leg attempt in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub id: i64,
    pub key: RecordKey,
    pub status: LegStatus,
    pub amount: Amount,
    pub comment: String,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// Optional criteria for the last-record query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub asset_type: Option<AssetType>,
    pub scene: Option<Scene>,
    pub direction: Option<LegDirection>,
}

impl RecordFilter {
    pub fn matches(&self, key: &RecordKey) -> bool {
        self.asset_type.is_none_or(|a| a == key.asset_type)
            && self.scene.is_none_or(|s| s == key.scene)
            && self.direction.is_none_or(|d| d == key.direction)
    }
}

/// Per-holder-per-asset quantity row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRow {
    pub id: i64,
    pub holder_id: HolderId,
    pub asset_type: AssetType,
    pub amount: Amount,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leg_comment_falls_back_to_saga_comment() {
        let req = TransferRequest::new(
            1,
            1,
            vec![TransferLeg::new(10, 1, 5, 1)],
            vec![TransferLeg::new(20, 1, 5, 2).with_comment("income")],
        )
        .with_comment("buy goods");
        let state = SagaState::from_request(&req);

        assert_eq!(state.leg_comment(&state.from_legs[0]), "buy goods");
        assert_eq!(state.leg_comment(&state.to_legs[0]), "income");
        assert_eq!(state.status, SagaStatus::Doing);
    }

    #[test]
    fn test_empty_rollback_marker() {
        let state = SagaState::empty_rollback(9, 2);
        assert_eq!(state.status, SagaStatus::RollbackDone);
        assert!(state.from_legs.is_empty() && state.to_legs.is_empty());
    }

    #[test]
    fn test_record_filter() {
        let key = RecordKey {
            holder_id: 1,
            transfer_id: 2,
            asset_type: 3,
            scene: 4,
            direction: LegDirection::Deduct,
            change_type: 5,
        };
        assert!(RecordFilter::default().matches(&key));
        assert!(
            RecordFilter {
                asset_type: Some(3),
                direction: Some(LegDirection::Deduct),
                ..Default::default()
            }
            .matches(&key)
        );
        assert!(
            !RecordFilter {
                scene: Some(5),
                ..Default::default()
            }
            .matches(&key)
        );
    }

    #[test]
    fn test_leg_json_shape() {
        let leg = TransferLeg::new(7, 1, 100, 3);
        let json = serde_json::to_string(&leg).unwrap();
        let parsed: TransferLeg =
            serde_json::from_str(r#"{"holder_id":7,"asset_type":1,"amount":100,"change_type":3}"#)
                .unwrap();
        assert_eq!(parsed, leg);
        assert!(json.contains("\"holder_id\":7"));
    }
}
