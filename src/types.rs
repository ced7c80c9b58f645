//! Common types for the withdrawal pipeline
//!
//! The lifecycle enum carries a sqlx::Type derive so the same value is used
//! in memory and in the `withdrawals` / `processes` tables.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle position of a withdrawal.
///
/// Declaration order is the stage order: `Load < Sent < Inchain`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Load,
    Sent,
    Inchain,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Sent => "sent",
            Stage::Inchain => "inchain",
        }
    }

    /// Withdrawals can only be cancelled before they are broadcast.
    pub fn is_cancelable(&self) -> bool {
        *self < Stage::Sent
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of operation a process record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessType {
    Withdraw,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Withdraw => "withdraw",
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A withdrawal accepted into the pipeline. Immutable after acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Unique per asset; 0 is only valid before the id is allocated
    pub id: i64,
    pub asset: String,
    pub amount: BigDecimal,
    pub address: String,
}

/// Withdrawal as stored by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedWithdrawal {
    pub id: i64,
    pub asset: String,
    pub amount: BigDecimal,
    pub address: String,
    pub stage: Stage,
    pub tx_hash: Option<String>,
    pub height: u64,
    pub tx_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedWithdrawal {
    /// Fresh LOAD record for a newly accepted request
    pub fn from_request(request: &WithdrawalRequest) -> Self {
        let now = Utc::now();
        Self {
            id: request.id,
            asset: request.asset.clone(),
            amount: request.amount.clone(),
            address: request.address.clone(),
            stage: Stage::Load,
            tx_hash: None,
            height: 0,
            tx_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_request(&self) -> WithdrawalRequest {
        WithdrawalRequest {
            id: self.id,
            asset: self.asset.clone(),
            amount: self.amount.clone(),
            address: self.address.clone(),
        }
    }
}

/// Externally visible state-machine record, overwritten on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: i64,
    pub asset: String,
    pub process_type: ProcessType,
    pub tx_hash: Option<String>,
    pub stage: Stage,
    pub cancelable: bool,
    pub height: u64,
    pub complete_height: u64,
    pub last_update_time: DateTime<Utc>,
}

impl ProcessRecord {
    /// Record for a withdrawal at `stage`. Cancelable is derived from the
    /// stage so the two can never disagree.
    pub fn withdraw(id: i64, asset: &str, stage: Stage) -> Self {
        Self {
            id,
            asset: asset.to_string(),
            process_type: ProcessType::Withdraw,
            tx_hash: None,
            stage,
            cancelable: stage.is_cancelable(),
            height: 0,
            complete_height: 0,
            last_update_time: Utc::now(),
        }
    }

    /// Record matching the stored stage of `withdrawal`
    pub fn from_withdrawal(withdrawal: &PersistedWithdrawal, stable_depth: u64) -> Self {
        let mut record = Self::withdraw(withdrawal.id, &withdrawal.asset, withdrawal.stage);
        if let Some(tx_hash) = &withdrawal.tx_hash {
            record = record.with_tx_hash(tx_hash);
        }
        if withdrawal.stage == Stage::Inchain {
            record = record.with_height(withdrawal.height, stable_depth);
        }
        record
    }

    pub fn with_tx_hash(mut self, tx_hash: &str) -> Self {
        self.tx_hash = Some(tx_hash.to_string());
        self
    }

    /// Sets the inclusion height and the height at which the downstream
    /// watcher may consider the withdrawal final.
    pub fn with_height(mut self, height: u64, stable_depth: u64) -> Self {
        self.height = height;
        self.complete_height = height + stable_depth;
        self
    }
}

/// One logical transfer inside a chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDetail {
    pub asset: String,
    pub tx_hash: String,
    pub address: String,
    pub amount: BigDecimal,
    pub height: u64,
    pub tx_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_stage_order() {
        assert!(Stage::Load < Stage::Sent);
        assert!(Stage::Sent < Stage::Inchain);
    }

    #[test]
    fn test_cancelable_follows_stage() {
        assert!(ProcessRecord::withdraw(1, "BTC", Stage::Load).cancelable);
        assert!(!ProcessRecord::withdraw(1, "BTC", Stage::Sent).cancelable);
        assert!(!ProcessRecord::withdraw(1, "BTC", Stage::Inchain).cancelable);
    }

    #[test]
    fn test_complete_height() {
        let record = ProcessRecord::withdraw(42, "BTC", Stage::Inchain)
            .with_tx_hash("abc")
            .with_height(100, 6);
        assert_eq!(record.height, 100);
        assert_eq!(record.complete_height, 106);
        assert_eq!(record.tx_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn test_record_from_stored_withdrawal() {
        let request = WithdrawalRequest {
            id: 9,
            asset: "BTC".to_string(),
            amount: BigDecimal::from(1),
            address: "X".to_string(),
        };
        let mut withdrawal = PersistedWithdrawal::from_request(&request);
        assert!(ProcessRecord::from_withdrawal(&withdrawal, 6).cancelable);

        withdrawal.stage = Stage::Sent;
        withdrawal.tx_hash = Some("h9".to_string());
        let record = ProcessRecord::from_withdrawal(&withdrawal, 6);
        assert_eq!(record.stage, Stage::Sent);
        assert!(!record.cancelable);
        assert_eq!(record.tx_hash.as_deref(), Some("h9"));
        assert_eq!(record.complete_height, 0);

        withdrawal.stage = Stage::Inchain;
        withdrawal.height = 100;
        assert_eq!(
            ProcessRecord::from_withdrawal(&withdrawal, 6).complete_height,
            106
        );
    }

    #[test]
    fn test_stage_as_str() {
        assert_eq!(Stage::Load.as_str(), "load");
        assert_eq!(Stage::Sent.as_str(), "sent");
        assert_eq!(format!("{}", Stage::Inchain), "inchain");
    }

    #[test]
    fn test_request_roundtrip_through_persisted() {
        let request = WithdrawalRequest {
            id: 7,
            asset: "BTC".to_string(),
            amount: BigDecimal::from_str("1.5").unwrap(),
            address: "X".to_string(),
        };
        let persisted = PersistedWithdrawal::from_request(&request);
        assert_eq!(persisted.stage, Stage::Load);
        assert!(persisted.tx_hash.is_none());
        assert_eq!(persisted.to_request(), request);
    }
}
