//! In-memory implementation of [`WithdrawalStore`]
//!
//! Used by the test suites and for running the pipeline locally without
//! Postgres. Supports injecting failures on individual operations.

use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{WithdrawalFilter, WithdrawalStore};
use crate::types::{PersistedWithdrawal, ProcessRecord, ProcessType, Stage};

/// Store operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertWithdrawal,
    MarkSent,
    MarkInChain,
    SaveProcess,
    UnfinishedWithdrawals,
}

#[derive(Default)]
struct Inner {
    withdrawals: BTreeMap<(String, i64), PersistedWithdrawal>,
    processes: HashMap<(String, ProcessType, i64), ProcessRecord>,
    /// Remaining injected failures per operation
    failures: HashMap<FailPoint, u32>,
}

impl Inner {
    fn check(&mut self, point: FailPoint) -> Result<()> {
        if let Some(remaining) = self.failures.get_mut(&point) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(eyre!("injected {:?} failure", point));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `point` fail
    pub fn fail_next(&self, point: FailPoint, times: u32) {
        self.lock().failures.insert(point, times);
    }

    /// Every process record currently stored, ordered by id
    pub fn processes(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<_> = self.lock().processes.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock only happens in a failing test
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WithdrawalStore for MemoryStore {
    async fn insert_withdrawal(&self, withdrawal: &PersistedWithdrawal) -> Result<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::InsertWithdrawal)?;
        let key = (withdrawal.asset.clone(), withdrawal.id);
        if inner.withdrawals.contains_key(&key) {
            return Err(eyre!(
                "duplicate key: withdrawal {} ({}) already exists",
                withdrawal.id,
                withdrawal.asset
            ));
        }
        inner.withdrawals.insert(key, withdrawal.clone());
        Ok(())
    }

    async fn get_withdrawal(&self, asset: &str, id: i64) -> Result<Option<PersistedWithdrawal>> {
        Ok(self.lock().withdrawals.get(&(asset.to_string(), id)).cloned())
    }

    async fn get_withdrawal_by_tx_hash(
        &self,
        asset: &str,
        tx_hash: &str,
    ) -> Result<Option<PersistedWithdrawal>> {
        Ok(self
            .lock()
            .withdrawals
            .values()
            .find(|w| w.asset == asset && w.tx_hash.as_deref() == Some(tx_hash))
            .cloned())
    }

    async fn withdrawal_exists(&self, asset: &str, id: i64) -> Result<bool> {
        Ok(self.lock().withdrawals.contains_key(&(asset.to_string(), id)))
    }

    async fn next_available_id(&self, asset: &str) -> Result<i64> {
        let max = self
            .lock()
            .withdrawals
            .keys()
            .filter(|(a, _)| a == asset)
            .map(|(_, id)| *id)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    async fn mark_sent(&self, asset: &str, id: i64, tx_hash: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::MarkSent)?;
        let withdrawal = inner
            .withdrawals
            .get_mut(&(asset.to_string(), id))
            .ok_or_else(|| eyre!("Withdrawal {} ({}) not found", id, asset))?;
        let same_hash = withdrawal.tx_hash.as_deref() == Some(tx_hash);
        match withdrawal.stage {
            Stage::Load => {}
            Stage::Sent if same_hash => {}
            _ => {
                return Err(eyre!(
                    "Withdrawal {} ({}) already sent under another hash",
                    id,
                    asset
                ))
            }
        }
        withdrawal.stage = Stage::Sent;
        withdrawal.tx_hash = Some(tx_hash.to_string());
        withdrawal.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_in_chain(
        &self,
        asset: &str,
        tx_hash: &str,
        height: u64,
        tx_index: u32,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::MarkInChain)?;
        for withdrawal in inner
            .withdrawals
            .values_mut()
            .filter(|w| w.asset == asset && w.tx_hash.as_deref() == Some(tx_hash))
        {
            withdrawal.stage = Stage::Inchain;
            withdrawal.height = height;
            withdrawal.tx_index = tx_index;
            withdrawal.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn withdrawal_id_by_tx_hash(&self, asset: &str, tx_hash: &str) -> Result<Option<i64>> {
        Ok(self
            .get_withdrawal_by_tx_hash(asset, tx_hash)
            .await?
            .map(|w| w.id))
    }

    async fn unfinished_withdrawals(&self, asset: &str) -> Result<Vec<PersistedWithdrawal>> {
        let mut inner = self.lock();
        inner.check(FailPoint::UnfinishedWithdrawals)?;
        Ok(inner
            .withdrawals
            .values()
            .filter(|w| w.asset == asset && w.stage < Stage::Inchain)
            .cloned()
            .collect())
    }

    async fn list_withdrawals(&self, filter: &WithdrawalFilter) -> Result<Vec<PersistedWithdrawal>> {
        Ok(self
            .lock()
            .withdrawals
            .values()
            .filter(|w| w.asset == filter.asset)
            .filter(|w| filter.id.map_or(true, |id| w.id == id))
            .filter(|w| {
                filter
                    .tx_hash
                    .as_deref()
                    .map_or(true, |h| w.tx_hash.as_deref() == Some(h))
            })
            .cloned()
            .collect())
    }

    async fn delete_withdrawal(&self, asset: &str, id: i64) -> Result<bool> {
        Ok(self
            .lock()
            .withdrawals
            .remove(&(asset.to_string(), id))
            .is_some())
    }

    async fn save_process(&self, record: &ProcessRecord) -> Result<()> {
        let mut inner = self.lock();
        inner.check(FailPoint::SaveProcess)?;
        inner.processes.insert(
            (record.asset.clone(), record.process_type, record.id),
            record.clone(),
        );
        Ok(())
    }

    async fn get_process(
        &self,
        asset: &str,
        process_type: ProcessType,
        id: i64,
    ) -> Result<Option<ProcessRecord>> {
        Ok(self
            .lock()
            .processes
            .get(&(asset.to_string(), process_type, id))
            .cloned())
    }

    async fn delete_process(
        &self,
        asset: &str,
        process_type: ProcessType,
        id: i64,
    ) -> Result<bool> {
        Ok(self
            .lock()
            .processes
            .remove(&(asset.to_string(), process_type, id))
            .is_some())
    }
}
