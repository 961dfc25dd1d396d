//! Saga and leg state definitions
//!
//! State IDs are stored as SMALLINT. The ordering of `SagaStatus` ids is
//! significant: the inspection sweep selects `status <= HalfSuccess`.

use std::fmt;

/// Saga aggregate status
///
/// ```text
/// Doing ──► HalfSuccess ──► Success
///   │  └──────────────────► Success
///   └──► RollbackDoing ──► RollbackDone
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i16)]
pub enum SagaStatus {
    /// Initial state, legs being applied
    Doing = 1,

    /// Compensation in progress
    RollbackDoing = 2,

    /// Deductions committed, increases applied asynchronously.
    /// Safely resumable; must eventually reach SUCCESS.
    HalfSuccess = 3,

    /// Terminal: every leg applied
    Success = 4,

    /// Terminal: every applied leg compensated
    RollbackDone = 5,
}

impl SagaStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Success | SagaStatus::RollbackDone)
    }

    /// Non-terminal states the inspection sweep drives forward
    #[inline]
    pub fn needs_inspection(&self) -> bool {
        *self <= SagaStatus::HalfSuccess
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(SagaStatus::Doing),
            2 => Some(SagaStatus::RollbackDoing),
            3 => Some(SagaStatus::HalfSuccess),
            4 => Some(SagaStatus::Success),
            5 => Some(SagaStatus::RollbackDone),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Doing => "DOING",
            SagaStatus::RollbackDoing => "ROLLBACK_DOING",
            SagaStatus::HalfSuccess => "HALF_SUCCESS",
            SagaStatus::Success => "SUCCESS",
            SagaStatus::RollbackDone => "ROLLBACK_DONE",
        }
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for SagaStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        SagaStatus::from_id(value).ok_or(())
    }
}

/// Status of a single ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum LegStatus {
    Normal = 1,
    /// Applied, then compensated
    Rollback = 2,
    /// Compensation arrived before the leg ever ran; nothing was moved
    EmptyRollback = 3,
}

impl LegStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(LegStatus::Normal),
            2 => Some(LegStatus::Rollback),
            3 => Some(LegStatus::EmptyRollback),
            _ => None,
        }
    }

    #[inline]
    pub fn is_compensated(&self) -> bool {
        matches!(self, LegStatus::Rollback | LegStatus::EmptyRollback)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegStatus::Normal => "NORMAL",
            LegStatus::Rollback => "ROLLBACK",
            LegStatus::EmptyRollback => "EMPTY_ROLLBACK",
        }
    }
}

impl fmt::Display for LegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a balance mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum LegDirection {
    Increase = 1,
    Deduct = 2,
}

impl LegDirection {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(LegDirection::Increase),
            2 => Some(LegDirection::Deduct),
            _ => None,
        }
    }

    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            LegDirection::Increase => LegDirection::Deduct,
            LegDirection::Deduct => LegDirection::Increase,
        }
    }

    /// Direction under which the record is keyed.
    ///
    /// A compensating mutation runs opposite to the leg it reverses but is
    /// recorded against that original leg, so both share one idempotency key.
    #[inline]
    pub fn record_direction(&self, status: LegStatus) -> Self {
        match status {
            LegStatus::Normal => *self,
            _ => self.opposite(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegDirection::Increase => "INCREASE",
            LegDirection::Deduct => "DEDUCT",
        }
    }
}

impl fmt::Display for LegDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
