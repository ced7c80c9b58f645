//! Persistence layer for withdrawals and their process records
//!
//! The pipeline only talks to storage through [`WithdrawalStore`]. Two
//! implementations ship with the crate: [`PgStore`] for production and
//! [`MemoryStore`] for tests and local runs.

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

pub mod memory;
pub mod models;

pub use memory::MemoryStore;
pub use models::*;

use crate::types::{PersistedWithdrawal, ProcessRecord, ProcessType};

/// Query filter for listing withdrawals of one asset
#[derive(Debug, Clone, Default)]
pub struct WithdrawalFilter {
    pub asset: String,
    pub id: Option<i64>,
    pub tx_hash: Option<String>,
}

/// Storage contract required by the withdrawal pipeline
#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    /// Insert a freshly accepted withdrawal (stage LOAD)
    async fn insert_withdrawal(&self, withdrawal: &PersistedWithdrawal) -> Result<()>;

    async fn get_withdrawal(&self, asset: &str, id: i64) -> Result<Option<PersistedWithdrawal>>;

    async fn get_withdrawal_by_tx_hash(
        &self,
        asset: &str,
        tx_hash: &str,
    ) -> Result<Option<PersistedWithdrawal>>;

    async fn withdrawal_exists(&self, asset: &str, id: i64) -> Result<bool>;

    /// One past the highest id ever stored for `asset`
    async fn next_available_id(&self, asset: &str) -> Result<i64>;

    /// Record the broadcast hash and move the withdrawal to SENT.
    ///
    /// Idempotent for the same hash; fails if the withdrawal is missing or
    /// was already sent under a different hash.
    async fn mark_sent(&self, asset: &str, id: i64, tx_hash: &str) -> Result<()>;

    /// Record chain inclusion for every withdrawal carried by `tx_hash`
    async fn mark_in_chain(
        &self,
        asset: &str,
        tx_hash: &str,
        height: u64,
        tx_index: u32,
    ) -> Result<()>;

    async fn withdrawal_id_by_tx_hash(&self, asset: &str, tx_hash: &str) -> Result<Option<i64>>;

    /// Withdrawals of `asset` that have not reached INCHAIN
    async fn unfinished_withdrawals(&self, asset: &str) -> Result<Vec<PersistedWithdrawal>>;

    async fn list_withdrawals(&self, filter: &WithdrawalFilter) -> Result<Vec<PersistedWithdrawal>>;

    /// Returns whether a row was deleted
    async fn delete_withdrawal(&self, asset: &str, id: i64) -> Result<bool>;

    /// Upsert keyed by (asset, process_type, id); the record is overwritten wholesale
    async fn save_process(&self, record: &ProcessRecord) -> Result<()>;

    async fn get_process(
        &self,
        asset: &str,
        process_type: ProcessType,
        id: i64,
    ) -> Result<Option<ProcessRecord>>;

    async fn delete_process(&self, asset: &str, process_type: ProcessType, id: i64)
        -> Result<bool>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// SQL SELECT columns for the withdrawals table (casting NUMERIC to TEXT)
const WITHDRAWAL_SELECT: &str = r#"id, asset, amount::TEXT as amount, address, stage, tx_hash,
    height, tx_index, created_at, updated_at"#;

/// SQL SELECT columns for the processes table
const PROCESS_SELECT: &str = r#"id, asset, process_type, tx_hash, stage, cancelable, height,
    complete_height, last_update_time"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn into_withdrawals(rows: Vec<WithdrawalRow>) -> Result<Vec<PersistedWithdrawal>> {
    rows.into_iter().map(PersistedWithdrawal::try_from).collect()
}

#[async_trait]
impl WithdrawalStore for PgStore {
    async fn insert_withdrawal(&self, withdrawal: &PersistedWithdrawal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO withdrawals (id, asset, amount, address, stage, tx_hash, height, tx_index)
            VALUES ($1, $2, $3::NUMERIC, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(withdrawal.id)
        .bind(&withdrawal.asset)
        .bind(withdrawal.amount.to_string())
        .bind(&withdrawal.address)
        .bind(withdrawal.stage)
        .bind(&withdrawal.tx_hash)
        .bind(withdrawal.height as i64)
        .bind(withdrawal.tx_index as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(
                error = %e,
                asset = %withdrawal.asset,
                id = withdrawal.id,
                "Database error inserting withdrawal"
            );
            e
        })
        .wrap_err_with(|| {
            format!(
                "Failed to insert withdrawal (asset={}, id={})",
                withdrawal.asset, withdrawal.id
            )
        })?;

        Ok(())
    }

    async fn get_withdrawal(&self, asset: &str, id: i64) -> Result<Option<PersistedWithdrawal>> {
        let query = format!(
            "SELECT {} FROM withdrawals WHERE asset = $1 AND id = $2",
            WITHDRAWAL_SELECT
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&query)
            .bind(asset)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get withdrawal {} for {}", id, asset))?;

        row.map(PersistedWithdrawal::try_from).transpose()
    }

    async fn get_withdrawal_by_tx_hash(
        &self,
        asset: &str,
        tx_hash: &str,
    ) -> Result<Option<PersistedWithdrawal>> {
        let query = format!(
            "SELECT {} FROM withdrawals WHERE asset = $1 AND tx_hash = $2 LIMIT 1",
            WITHDRAWAL_SELECT
        );
        let row = sqlx::query_as::<_, WithdrawalRow>(&query)
            .bind(asset)
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get withdrawal by tx_hash {}", tx_hash))?;

        row.map(PersistedWithdrawal::try_from).transpose()
    }

    async fn withdrawal_exists(&self, asset: &str, id: i64) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"SELECT EXISTS(SELECT 1 FROM withdrawals WHERE asset = $1 AND id = $2)"#,
        )
        .bind(asset)
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .wrap_err("Failed to check withdrawal existence")?;

        Ok(row.0)
    }

    async fn next_available_id(&self, asset: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"SELECT COALESCE(MAX(id), 0) + 1 FROM withdrawals WHERE asset = $1"#,
        )
        .bind(asset)
        .fetch_one(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to allocate withdrawal id for {}", asset))?;

        Ok(row.0)
    }

    async fn mark_sent(&self, asset: &str, id: i64, tx_hash: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE withdrawals SET stage = 'sent', tx_hash = $3, updated_at = NOW()
            WHERE asset = $1 AND id = $2
              AND (stage = 'load' OR (stage = 'sent' AND tx_hash = $3))
            "#,
        )
        .bind(asset)
        .bind(id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to mark withdrawal {} as sent", id))?;

        if result.rows_affected() == 0 {
            return Err(eyre!(
                "Withdrawal {} ({}) missing or already sent under another hash",
                id,
                asset
            ));
        }
        Ok(())
    }

    async fn mark_in_chain(
        &self,
        asset: &str,
        tx_hash: &str,
        height: u64,
        tx_index: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE withdrawals SET stage = 'inchain', height = $3, tx_index = $4, updated_at = NOW()
            WHERE asset = $1 AND tx_hash = $2
            "#,
        )
        .bind(asset)
        .bind(tx_hash)
        .bind(height as i64)
        .bind(tx_index as i32)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to mark tx {} as in chain", tx_hash))?;

        Ok(())
    }

    async fn withdrawal_id_by_tx_hash(&self, asset: &str, tx_hash: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT id FROM withdrawals WHERE asset = $1 AND tx_hash = $2 LIMIT 1"#,
        )
        .bind(asset)
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to resolve withdrawal id for tx {}", tx_hash))?;

        Ok(row.map(|r| r.0))
    }

    async fn unfinished_withdrawals(&self, asset: &str) -> Result<Vec<PersistedWithdrawal>> {
        let query = format!(
            "SELECT {} FROM withdrawals WHERE asset = $1 AND stage IN ('load', 'sent') ORDER BY id",
            WITHDRAWAL_SELECT
        );
        let rows = sqlx::query_as::<_, WithdrawalRow>(&query)
            .bind(asset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("SQL error getting unfinished withdrawals: {:?}", e);
                e
            })
            .wrap_err("Failed to get unfinished withdrawals")?;

        into_withdrawals(rows)
    }

    async fn list_withdrawals(&self, filter: &WithdrawalFilter) -> Result<Vec<PersistedWithdrawal>> {
        let query = format!(
            r#"SELECT {} FROM withdrawals
               WHERE asset = $1
                 AND ($2::BIGINT IS NULL OR id = $2)
                 AND ($3::VARCHAR IS NULL OR tx_hash = $3)
               ORDER BY id"#,
            WITHDRAWAL_SELECT
        );
        let rows = sqlx::query_as::<_, WithdrawalRow>(&query)
            .bind(&filter.asset)
            .bind(filter.id)
            .bind(&filter.tx_hash)
            .fetch_all(&self.pool)
            .await
            .wrap_err("Failed to list withdrawals")?;

        into_withdrawals(rows)
    }

    async fn delete_withdrawal(&self, asset: &str, id: i64) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM withdrawals WHERE asset = $1 AND id = $2"#)
            .bind(asset)
            .bind(id)
            .execute(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to delete withdrawal {}", id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_process(&self, record: &ProcessRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO processes (id, asset, process_type, tx_hash, stage, cancelable, height,
                complete_height, last_update_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (asset, process_type, id) DO UPDATE SET
                tx_hash = EXCLUDED.tx_hash,
                stage = EXCLUDED.stage,
                cancelable = EXCLUDED.cancelable,
                height = EXCLUDED.height,
                complete_height = EXCLUDED.complete_height,
                last_update_time = EXCLUDED.last_update_time
            "#,
        )
        .bind(record.id)
        .bind(&record.asset)
        .bind(record.process_type)
        .bind(&record.tx_hash)
        .bind(record.stage)
        .bind(record.cancelable)
        .bind(record.height as i64)
        .bind(record.complete_height as i64)
        .bind(record.last_update_time)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| {
            format!(
                "Failed to save {} process {} at stage {}",
                record.process_type, record.id, record.stage
            )
        })?;

        Ok(())
    }

    async fn get_process(
        &self,
        asset: &str,
        process_type: ProcessType,
        id: i64,
    ) -> Result<Option<ProcessRecord>> {
        let query = format!(
            "SELECT {} FROM processes WHERE asset = $1 AND process_type = $2 AND id = $3",
            PROCESS_SELECT
        );
        let row = sqlx::query_as::<_, ProcessRow>(&query)
            .bind(asset)
            .bind(process_type)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get {} process {}", process_type, id))?;

        Ok(row.map(ProcessRecord::from))
    }

    async fn delete_process(
        &self,
        asset: &str,
        process_type: ProcessType,
        id: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"DELETE FROM processes WHERE asset = $1 AND process_type = $2 AND id = $3"#,
        )
        .bind(asset)
        .bind(process_type)
        .bind(id)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to delete {} process {}", process_type, id))?;

        Ok(result.rows_affected() > 0)
    }
}
