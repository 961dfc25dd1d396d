//! PostgreSQL storage backend
//!
//! One connection pool per physical database. Table names are
//! `{kind}_{family}{suffix}` where the suffix comes from the router.
//! All status changes are atomic CAS updates; balance changes are single
//! arithmetic UPDATEs, never read-modify-write.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

use crate::config::{ConfigError, EngineConfig, LedgerKind};
use crate::core_types::{Amount, AssetType, HolderId, Scene, TimestampMs, TransferId, now_ms};
use crate::router::{Routing, ShardHandle};
use crate::transfer::state::{LegDirection, LegStatus, SagaStatus};
use crate::transfer::types::{
    BalanceRow, RecordEntry, RecordFilter, RecordKey, SagaState, TransferLeg,
};

use super::{LedgerStore, LedgerTx, NewRecord, StoreError};

const BALANCE_COLUMNS: &str = "id, holder_id, asset_type, amount, created_at, updated_at";
const RECORD_COLUMNS: &str = "id, holder_id, transfer_id, asset_type, scene, direction, status, \
                              change_type, amount, comment, created_at, updated_at";
const SAGA_COLUMNS: &str =
    "id, transfer_id, scene, from_legs, to_legs, status, comment, created_at, updated_at";

pub struct PgStore {
    pools: Vec<PgPool>,
    routing: Routing,
    kind: LedgerKind,
}

impl PgStore {
    pub fn new(pools: Vec<PgPool>, routing: Routing, kind: LedgerKind) -> Self {
        Self {
            pools,
            routing,
            kind,
        }
    }

    /// Connect one pool per url; `urls.len()` must equal `db_count`
    pub async fn connect(config: &EngineConfig, urls: &[String]) -> Result<Self, StoreError> {
        if urls.len() != config.db_count as usize {
            let mismatch = ConfigError::DbUrlMismatch {
                expected: config.db_count,
                actual: urls.len(),
            };
            return Err(StoreError::Backend(mismatch.to_string()));
        }

        let mut pools = Vec::with_capacity(urls.len());
        for url in urls {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await?;
            pools.push(pool);
        }
        info!(db_count = pools.len(), kind = ?config.ledger_kind, "PostgreSQL pools established");

        Ok(Self::new(pools, Routing::from_config(config), config.ledger_kind))
    }

    /// Create every shard table on every database (idempotent)
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for (db_index, pool) in self.pools.iter().enumerate() {
            for shard in shards_on(self.routing.balance.all_shards(), db_index) {
                let t = self.balance_table(shard);
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        id BIGSERIAL PRIMARY KEY,
                        holder_id BIGINT NOT NULL,
                        asset_type INT NOT NULL,
                        amount BIGINT NOT NULL DEFAULT 0,
                        created_at BIGINT NOT NULL,
                        updated_at BIGINT NOT NULL,
                        UNIQUE (holder_id, asset_type)
                    )
                    "#
                ))
                .execute(pool)
                .await?;
            }

            for shard in shards_on(self.routing.record.all_shards(), db_index) {
                let t = self.record_table(shard);
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        id BIGSERIAL PRIMARY KEY,
                        holder_id BIGINT NOT NULL,
                        transfer_id BIGINT NOT NULL,
                        asset_type INT NOT NULL,
                        scene INT NOT NULL,
                        direction SMALLINT NOT NULL,
                        status SMALLINT NOT NULL,
                        change_type INT NOT NULL,
                        amount BIGINT NOT NULL,
                        comment TEXT NOT NULL DEFAULT '',
                        created_at BIGINT NOT NULL,
                        updated_at BIGINT NOT NULL,
                        UNIQUE (holder_id, transfer_id, asset_type, scene, direction, change_type)
                    )
                    "#
                ))
                .execute(pool)
                .await?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {t}_holder_idx ON {t} (holder_id, id)"
                ))
                .execute(pool)
                .await?;
            }

            for shard in shards_on(self.routing.state.all_shards(), db_index) {
                let t = self.saga_table(shard);
                sqlx::query(&format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {t} (
                        id BIGSERIAL PRIMARY KEY,
                        transfer_id BIGINT NOT NULL,
                        scene INT NOT NULL,
                        from_legs TEXT NOT NULL,
                        to_legs TEXT NOT NULL,
                        status SMALLINT NOT NULL,
                        comment TEXT NOT NULL DEFAULT '',
                        created_at BIGINT NOT NULL,
                        updated_at BIGINT NOT NULL,
                        UNIQUE (transfer_id, scene)
                    )
                    "#
                ))
                .execute(pool)
                .await?;
                sqlx::query(&format!(
                    "CREATE INDEX IF NOT EXISTS {t}_inspect_idx ON {t} (status, updated_at)"
                ))
                .execute(pool)
                .await?;
            }
        }
        info!(kind = ?self.kind, "Ledger schema ensured");
        Ok(())
    }

    fn pool(&self, shard: ShardHandle) -> Result<&PgPool, StoreError> {
        self.pools
            .get(shard.db_index)
            .ok_or_else(|| StoreError::Backend(format!("no pool for shard {}", shard)))
    }

    fn balance_table(&self, shard: ShardHandle) -> String {
        format!("{}_balance{}", self.kind.table_prefix(), shard.table_suffix())
    }

    fn record_table(&self, shard: ShardHandle) -> String {
        format!("{}_record{}", self.kind.table_prefix(), shard.table_suffix())
    }

    fn saga_table(&self, shard: ShardHandle) -> String {
        format!("{}_saga_state{}", self.kind.table_prefix(), shard.table_suffix())
    }
}

fn shards_on(shards: Vec<ShardHandle>, db_index: usize) -> impl Iterator<Item = ShardHandle> {
    shards.into_iter().filter(move |s| s.db_index == db_index)
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn get_balances(
        &self,
        holder_id: HolderId,
    ) -> Result<HashMap<AssetType, Amount>, StoreError> {
        let shard = self.routing.balance.route(holder_id);
        let rows = sqlx::query(&format!(
            "SELECT asset_type, amount FROM {} WHERE holder_id = $1",
            self.balance_table(shard)
        ))
        .bind(holder_id)
        .fetch_all(self.pool(shard)?)
        .await?;

        let mut amounts = HashMap::with_capacity(rows.len());
        for row in rows {
            amounts.insert(row.try_get("asset_type")?, row.try_get("amount")?);
        }
        Ok(amounts)
    }

    async fn get_balance(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<Option<BalanceRow>, StoreError> {
        let shard = self.routing.balance.route(holder_id);
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM {} WHERE holder_id = $1 AND asset_type = $2",
            self.balance_table(shard)
        ))
        .bind(holder_id)
        .bind(asset_type)
        .fetch_optional(self.pool(shard)?)
        .await?;

        row.as_ref().map(row_to_balance).transpose()
    }

    async fn insert_balance(
        &self,
        holder_id: HolderId,
        asset_type: AssetType,
    ) -> Result<BalanceRow, StoreError> {
        let shard = self.routing.balance.route(holder_id);
        let now = now_ms();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (holder_id, asset_type, amount, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $3)
            RETURNING {BALANCE_COLUMNS}
            "#,
            self.balance_table(shard)
        ))
        .bind(holder_id)
        .bind(asset_type)
        .bind(now)
        .fetch_one(self.pool(shard)?)
        .await?;

        row_to_balance(&row)
    }

    async fn get_record(&self, key: &RecordKey) -> Result<Option<RecordEntry>, StoreError> {
        let shard = self.routing.record.route(key.holder_id);
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM {}
            WHERE holder_id = $1 AND transfer_id = $2 AND asset_type = $3
              AND scene = $4 AND direction = $5 AND change_type = $6
            "#,
            self.record_table(shard)
        ))
        .bind(key.holder_id)
        .bind(key.transfer_id)
        .bind(key.asset_type)
        .bind(key.scene)
        .bind(key.direction.id())
        .bind(key.change_type)
        .fetch_optional(self.pool(shard)?)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn last_record(
        &self,
        holder_id: HolderId,
        filter: &RecordFilter,
    ) -> Result<Option<RecordEntry>, StoreError> {
        let shard = self.routing.record.route(holder_id);
        // NULL parameters disable the corresponding criterion
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM {}
            WHERE holder_id = $1 AND status = $2
              AND ($3::INT IS NULL OR asset_type = $3)
              AND ($4::INT IS NULL OR scene = $4)
              AND ($5::SMALLINT IS NULL OR direction = $5)
            ORDER BY id DESC
            LIMIT 1
            "#,
            self.record_table(shard)
        ))
        .bind(holder_id)
        .bind(LegStatus::Normal.id())
        .bind(filter.asset_type)
        .bind(filter.scene)
        .bind(filter.direction.map(|d| d.id()))
        .fetch_optional(self.pool(shard)?)
        .await?;

        row.as_ref().map(row_to_record).transpose()
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
        let tx = self.pool(record_shard)?.begin().await?;
        Ok(Box::new(PgLedgerTx {
            tx: Some(tx),
            record_table: self.record_table(record_shard),
            balance_table: self.balance_table(balance_shard),
        }))
    }

    async fn get_saga(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<Option<SagaState>, StoreError> {
        let shard = self.routing.state.route(transfer_id);
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM {} WHERE transfer_id = $1 AND scene = $2",
            self.saga_table(shard)
        ))
        .bind(transfer_id)
        .bind(scene)
        .fetch_optional(self.pool(shard)?)
        .await?;

        row.as_ref().map(row_to_saga).transpose()
    }

    async fn insert_saga(&self, state: &SagaState) -> Result<SagaState, StoreError> {
        let shard = self.routing.state.route(state.transfer_id);
        let now = now_ms();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {} (transfer_id, scene, from_legs, to_legs, status, comment, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {SAGA_COLUMNS}
            "#,
            self.saga_table(shard)
        ))
        .bind(state.transfer_id)
        .bind(state.scene)
        .bind(serde_json::to_string(&state.from_legs)?)
        .bind(serde_json::to_string(&state.to_legs)?)
        .bind(state.status.id())
        .bind(&state.comment)
        .bind(now)
        .fetch_one(self.pool(shard)?)
        .await?;

        row_to_saga(&row)
    }

    async fn update_saga_status(
        &self,
        transfer_id: TransferId,
        scene: Scene,
        from: SagaStatus,
        to: SagaStatus,
    ) -> Result<bool, StoreError> {
        let shard = self.routing.state.route(transfer_id);
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $1, updated_at = $2
            WHERE transfer_id = $3 AND scene = $4 AND status = $5
            "#,
            self.saga_table(shard)
        ))
        .bind(to.id())
        .bind(now_ms())
        .bind(transfer_id)
        .bind(scene)
        .bind(from.id())
        .execute(self.pool(shard)?)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_rollback_doing(
        &self,
        transfer_id: TransferId,
        scene: Scene,
    ) -> Result<bool, StoreError> {
        let shard = self.routing.state.route(transfer_id);
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $1, updated_at = $2
            WHERE transfer_id = $3 AND scene = $4 AND status <> $5
            "#,
            self.saga_table(shard)
        ))
        .bind(SagaStatus::RollbackDoing.id())
        .bind(now_ms())
        .bind(transfer_id)
        .bind(scene)
        .bind(SagaStatus::RollbackDone.id())
        .execute(self.pool(shard)?)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale_sagas(&self, deadline: TimestampMs) -> Result<Vec<SagaState>, StoreError> {
        let scans = self
            .routing
            .state
            .all_shards()
            .into_iter()
            .map(|shard| self.stale_in_shard(shard, deadline));
        let per_shard = futures::future::try_join_all(scans).await?;
        Ok(per_shard.into_iter().flatten().collect())
    }
}

impl PgStore {
    async fn stale_in_shard(
        &self,
        shard: ShardHandle,
        deadline: TimestampMs,
    ) -> Result<Vec<SagaState>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS} FROM {}
            WHERE status <= $1 AND updated_at <= $2
            ORDER BY updated_at ASC
            "#,
            self.saga_table(shard)
        ))
        .bind(SagaStatus::HalfSuccess.id())
        .bind(deadline)
        .fetch_all(self.pool(shard)?)
        .await?;

        rows.iter().map(row_to_saga).collect()
    }
}

struct PgLedgerTx {
    /// `None` once committed
    tx: Option<Transaction<'static, Postgres>>,
    record_table: String,
    balance_table: String,
}

impl PgLedgerTx {
    fn conn(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already committed".to_string()))
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn insert_record(&mut self, record: &NewRecord) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {}
                (holder_id, transfer_id, asset_type, scene, direction, status,
                 change_type, amount, comment, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
            self.record_table
        );
        let tx = self.conn()?;
        sqlx::query(&sql)
            .bind(record.key.holder_id)
            .bind(record.key.transfer_id)
            .bind(record.key.asset_type)
            .bind(record.key.scene)
            .bind(record.key.direction.id())
            .bind(record.status.id())
            .bind(record.key.change_type)
            .bind(record.amount)
            .bind(&record.comment)
            .bind(now_ms())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn update_record_status(
        &mut self,
        key: &RecordKey,
        from: LegStatus,
        to: LegStatus,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET status = $1, updated_at = $2
            WHERE holder_id = $3 AND transfer_id = $4 AND asset_type = $5
              AND scene = $6 AND direction = $7 AND change_type = $8 AND status = $9
            "#,
            self.record_table
        );
        let tx = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(to.id())
            .bind(now_ms())
            .bind(key.holder_id)
            .bind(key.transfer_id)
            .bind(key.asset_type)
            .bind(key.scene)
            .bind(key.direction.id())
            .bind(key.change_type)
            .bind(from.id())
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deduct(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
        delta: Amount,
        guarded: bool,
    ) -> Result<bool, StoreError> {
        let guard = if guarded { " AND amount - $1 >= 0" } else { "" };
        let sql = format!(
            "UPDATE {} SET amount = amount - $1, updated_at = $2 \
             WHERE holder_id = $3 AND asset_type = $4{guard}",
            self.balance_table
        );
        let tx = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(delta)
            .bind(now_ms())
            .bind(holder_id)
            .bind(asset_type)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn increase(
        &mut self,
        holder_id: HolderId,
        asset_type: AssetType,
        delta: Amount,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {} SET amount = amount + $1, updated_at = $2 \
             WHERE holder_id = $3 AND asset_type = $4",
            self.balance_table
        );
        let tx = self.conn()?;
        let result = sqlx::query(&sql)
            .bind(delta)
            .bind(now_ms())
            .bind(holder_id)
            .bind(asset_type)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(StoreError::Backend(
                "transaction already committed".to_string(),
            )),
        }
    }
}

fn row_to_balance(row: &PgRow) -> Result<BalanceRow, StoreError> {
    Ok(BalanceRow {
        id: row.try_get("id")?,
        holder_id: row.try_get("holder_id")?,
        asset_type: row.try_get("asset_type")?,
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_record(row: &PgRow) -> Result<RecordEntry, StoreError> {
    let direction_id: i16 = row.try_get("direction")?;
    let direction = LegDirection::from_id(direction_id)
        .ok_or_else(|| StoreError::Corrupt(format!("Invalid direction: {}", direction_id)))?;

    let status_id: i16 = row.try_get("status")?;
    let status = LegStatus::from_id(status_id)
        .ok_or_else(|| StoreError::Corrupt(format!("Invalid record status: {}", status_id)))?;

    Ok(RecordEntry {
        id: row.try_get("id")?,
        key: RecordKey {
            holder_id: row.try_get("holder_id")?,
            transfer_id: row.try_get("transfer_id")?,
            asset_type: row.try_get("asset_type")?,
            scene: row.try_get("scene")?,
            direction,
            change_type: row.try_get("change_type")?,
        },
        status,
        amount: row.try_get("amount")?,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_saga(row: &PgRow) -> Result<SagaState, StoreError> {
    let status_id: i16 = row.try_get("status")?;
    let status = SagaStatus::from_id(status_id)
        .ok_or_else(|| StoreError::Corrupt(format!("Invalid saga status: {}", status_id)))?;

    let from_legs: String = row.try_get("from_legs")?;
    let to_legs: String = row.try_get("to_legs")?;

    Ok(SagaState {
        id: row.try_get("id")?,
        transfer_id: row.try_get("transfer_id")?,
        scene: row.try_get("scene")?,
        from_legs: serde_json::from_str::<Vec<TransferLeg>>(&from_legs)?,
        to_legs: serde_json::from_str::<Vec<TransferLeg>>(&to_legs)?,
        status,
        comment: row.try_get("comment")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
