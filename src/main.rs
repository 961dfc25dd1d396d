//! Shard Ledger daemon
//!
//! Runs the inspection sweep against the configured databases:
//!
//! ```text
//! config/{env}.yaml ──▶ PgStore (one pool per db) ──▶ RecoveryWorker
//!                                                      │ every scan_interval
//!                                                      ▼
//!                                            inspect(now - stale_threshold)
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use shard_ledger::config::AppConfig;
use shard_ledger::core_types::{Scene, TransferId};
use shard_ledger::logging::init_logging;
use shard_ledger::store::PgStore;
use shard_ledger::transfer::{
    ErrorHook, RecoveryWorker, TransferCoordinator, TransferError, WorkerConfig,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).context("loading configuration")?;
    let _log_guard = init_logging(&app_config);

    info!(
        env = %env,
        kind = ?app_config.engine.ledger_kind,
        db_count = app_config.engine.db_count,
        "Starting shard ledger"
    );

    let store = PgStore::connect(&app_config.engine, &app_config.postgres_urls)
        .await
        .context("connecting to PostgreSQL")?;
    store.ensure_schema().await.context("creating ledger tables")?;

    // Background failures are retried by the sweep; surface them meanwhile
    let hook: ErrorHook = Arc::new(|transfer_id: TransferId, scene: Scene, err: &TransferError| {
        error!(
            transfer_id,
            scene,
            code = err.code(),
            error = %err,
            "Background transfer failure"
        );
    });
    let coordinator = TransferCoordinator::new(Arc::new(store), app_config.engine.clone())?
        .with_error_hook(hook);

    let worker = RecoveryWorker::new(
        Arc::new(coordinator),
        WorkerConfig::from(&app_config.worker),
    );
    worker.run().await
}
