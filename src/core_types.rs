//! Core types used throughout the ledger
//!
//! Plain aliases with semantic names. Every id is signed because the storage
//! layer keys rows on BIGINT/INT columns and the router works on `i64`.

/// Holder ID - owner of balance rows (wallet, account, bag).
///
/// # Ranges:
/// - `official_min..=official_max`: official/treasury holders, meshed across buckets
/// - everything above: ordinary holders, guarded against overdraft
pub type HolderId = i64;

/// Transfer ID - caller-supplied, unique per scene
pub type TransferId = i64;

/// Asset type (coin kind, item kind)
pub type AssetType = i32;

/// Business scene a transfer belongs to
pub type Scene = i32;

/// Caller-defined change type of a single leg (e.g. "spend", "income")
pub type ChangeType = i32;

/// Signed quantity. Ordinary balances stay >= 0, official and rolled-back
/// balances may go negative.
pub type Amount = i64;

/// Unix timestamp in milliseconds
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds
#[inline]
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}
