//! Transfer request validation
//!
//! Runs on raw (un-meshed) holder ids, before any saga exists.

use std::collections::{BTreeMap, HashSet};

use crate::core_types::{Amount, AssetType, ChangeType, HolderId};
use crate::official::OfficialRange;

use super::error::TransferError;
use super::types::{TransferLeg, TransferRequest};

pub fn validate_transfer(
    req: &TransferRequest,
    official: &OfficialRange,
) -> Result<(), TransferError> {
    if req.transfer_id <= 0 || req.scene <= 0 {
        return Err(invalid(format!(
            "invalid transfer_id {} or scene {}",
            req.transfer_id, req.scene
        )));
    }
    if req.from.is_empty() || req.to.is_empty() {
        return Err(invalid("empty from or to legs"));
    }

    let mut seen: HashSet<(HolderId, ChangeType)> = HashSet::new();
    let mut from_totals: BTreeMap<AssetType, Amount> = BTreeMap::new();
    let mut to_totals: BTreeMap<AssetType, Amount> = BTreeMap::new();

    for leg in &req.from {
        validate_leg(leg, "from", official, &mut seen)?;
        add_total(&mut from_totals, leg)?;
    }
    for leg in &req.to {
        validate_leg(leg, "to", official, &mut seen)?;
        add_total(&mut to_totals, leg)?;
    }

    if from_totals != to_totals {
        return Err(invalid(format!(
            "unbalanced transfer amounts from:{:?} to:{:?}",
            from_totals, to_totals
        )));
    }
    Ok(())
}

fn validate_leg(
    leg: &TransferLeg,
    side: &str,
    official: &OfficialRange,
    seen: &mut HashSet<(HolderId, ChangeType)>,
) -> Result<(), TransferError> {
    if leg.holder_id <= 0 {
        return Err(invalid(format!("invalid {} holder id: {}", side, leg.holder_id)));
    }

    if official.contains(leg.holder_id) {
        if !official.is_bucket(leg.holder_id) {
            return Err(invalid(format!(
                "invalid official {} holder: {}",
                side, leg.holder_id
            )));
        }
        // zero records provenance without moving value
        if leg.amount < 0 {
            return Err(invalid(format!(
                "invalid official {} amount: {}",
                side, leg.amount
            )));
        }
    } else if leg.amount <= 0 {
        return Err(invalid(format!("invalid {} amount: {}", side, leg.amount)));
    }

    if !seen.insert((leg.holder_id, leg.change_type)) {
        return Err(invalid(format!(
            "duplicate change type {} for holder {}",
            leg.change_type, leg.holder_id
        )));
    }
    Ok(())
}

fn add_total(
    totals: &mut BTreeMap<AssetType, Amount>,
    leg: &TransferLeg,
) -> Result<(), TransferError> {
    let total = totals.entry(leg.asset_type).or_insert(0);
    *total = total
        .checked_add(leg.amount)
        .ok_or_else(|| invalid(format!("amount overflow for asset {}", leg.asset_type)))?;
    Ok(())
}

fn invalid(msg: impl Into<String>) -> TransferError {
    TransferError::InvalidParams(msg.into())
}
