//! Saga Transfer Engine
//!
//! Moves typed assets from one or more source holders to one or more
//! destination holders, exactly once, across independently sharded
//! databases without distributed transactions.
//!
//! # State Machine
//!
//! ```text
//! DOING ──deductions──> HALF_SUCCESS ──increases──> SUCCESS
//!   │         └──────────── increases ────────────────┘
//!   │
//!   └─failure / stuck──> ROLLBACK_DOING ──compensation──> ROLLBACK_DONE
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Idempotent legs**: every balance mutation is paired with a unique
//!    ledger record in the same local transaction
//! 2. **Deduct first**: no destination is credited before every source paid
//! 3. **No resurrection**: a transfer never applies after its rollback
//! 4. **Convergence**: the inspection sweep drives every stuck saga to
//!    SUCCESS or ROLLBACK_DONE

pub mod balance;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod inspection;
pub mod record;
pub mod rollback;
pub mod saga;
pub mod state;
pub mod types;
pub mod validation;
pub mod worker;


// Re-exports for convenience
pub use coordinator::TransferCoordinator;
pub use error::TransferError;
pub use executor::ErrorHook;
pub use state::{LegDirection, LegStatus, SagaStatus};
pub use types::{
    BalanceRow, RecordEntry, RecordFilter, RecordKey, RollbackRequest, SagaState, TransferLeg,
    TransferRequest,
};
pub use worker::{RecoveryWorker, WorkerConfig};
