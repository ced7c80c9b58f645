use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::FromRow;
use std::str::FromStr;

use crate::types::{PersistedWithdrawal, ProcessRecord, ProcessType, Stage};

// Note: amounts are stored as NUMERIC in the database. We bind them as text and
// cast in SQL ($n::NUMERIC), and read them back with amount::TEXT, then parse
// into BigDecimal here. This sidesteps BigDecimal version coupling with sqlx.

/// Row of the `withdrawals` table
#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalRow {
    pub id: i64,
    pub asset: String,
    pub amount: String,
    pub address: String,
    pub stage: Stage,
    pub tx_hash: Option<String>,
    pub height: i64,
    pub tx_index: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<WithdrawalRow> for PersistedWithdrawal {
    type Error = eyre::Report;

    fn try_from(row: WithdrawalRow) -> Result<Self> {
        let amount = BigDecimal::from_str(&row.amount)
            .wrap_err_with(|| format!("Invalid amount {:?} on withdrawal {}", row.amount, row.id))?;
        Ok(Self {
            id: row.id,
            asset: row.asset,
            amount,
            address: row.address,
            stage: row.stage,
            tx_hash: row.tx_hash,
            height: row.height.max(0) as u64,
            tx_index: row.tx_index.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row of the `processes` table
#[derive(Debug, Clone, FromRow)]
pub struct ProcessRow {
    pub id: i64,
    pub asset: String,
    pub process_type: ProcessType,
    pub tx_hash: Option<String>,
    pub stage: Stage,
    pub cancelable: bool,
    pub height: i64,
    pub complete_height: i64,
    pub last_update_time: DateTime<Utc>,
}

impl From<ProcessRow> for ProcessRecord {
    fn from(row: ProcessRow) -> Self {
        Self {
            id: row.id,
            asset: row.asset,
            process_type: row.process_type,
            tx_hash: row.tx_hash,
            stage: row.stage,
            cancelable: row.cancelable,
            height: row.height.max(0) as u64,
            complete_height: row.complete_height.max(0) as u64,
            last_update_time: row.last_update_time,
        }
    }
}
