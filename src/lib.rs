//! Shard Ledger - Saga Transfer Engine
//!
//! Moves typed assets between holders across sharded databases, exactly
//! once, with compensating rollback and a recovery sweep. Meant to be
//! embedded behind a wallet, account or inventory service.
//!
//! # Modules
//!
//! - [`core_types`] - Id and amount aliases
//! - [`config`] - YAML configuration and engine settings
//! - [`logging`] - tracing subscriber setup
//! - [`official`] - Official (treasury) holder meshing
//! - [`router`] - Shard routing for the three table families
//! - [`store`] - Storage adapters (PostgreSQL, in-memory)
//! - [`transfer`] - Saga coordinator, executor, compensator, sweeper

// Core types - must be first!
pub mod core_types;

pub mod config;
pub mod logging;
pub mod official;
pub mod router;
pub mod store;
pub mod transfer;

// Convenient re-exports at crate root
pub use config::{AppConfig, ConfigError, EngineConfig, LedgerKind};
pub use core_types::{AssetType, ChangeType, HolderId, Scene, TransferId};
pub use official::OfficialRange;
pub use store::{LedgerStore, LedgerTx, MemoryStore, PgStore, StoreError};
pub use transfer::{
    ErrorHook, RecordFilter, RollbackRequest, SagaState, SagaStatus, TransferCoordinator,
    TransferError, TransferLeg, TransferRequest,
};
