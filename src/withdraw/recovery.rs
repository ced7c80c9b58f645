//! Startup recovery of unfinished withdrawals

use eyre::{Result, WrapErr};
use tracing::{info, warn};

use super::Shared;
use crate::metrics;
use crate::types::{PersistedWithdrawal, ProcessRecord, ProcessType, Stage};

/// Counts of withdrawals reloaded into each queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub pending: usize,
    pub watching: usize,
    /// Process records rewritten to match the stored withdrawal stage
    pub repaired: usize,
}

/// Requeue every withdrawal of the asset that has not reached INCHAIN.
///
/// LOAD withdrawals go back to the pending set; SENT withdrawals have their
/// hash watched again from a zero poll count. A process record left behind
/// by an interrupted transition is rewritten from the withdrawal first.
pub(crate) async fn load_unfinished(shared: &Shared) -> Result<RecoveryReport> {
    let unfinished = shared
        .store
        .unfinished_withdrawals(&shared.asset)
        .await
        .wrap_err_with(|| format!("Failed to load unfinished {} withdrawals", shared.asset))?;

    let mut report = RecoveryReport::default();
    for withdrawal in &unfinished {
        if repair_process(shared, withdrawal).await? {
            report.repaired += 1;
        }
    }

    let mut pending = shared.pending.write().await;
    let mut watch = shared.watch.write().await;

    for withdrawal in unfinished {
        match withdrawal.stage {
            Stage::Load => {
                pending.push(withdrawal.to_request());
                report.pending += 1;
            }
            Stage::Sent => match withdrawal.tx_hash {
                Some(tx_hash) if !tx_hash.is_empty() => {
                    watch.insert(tx_hash);
                    report.watching += 1;
                }
                _ => {
                    warn!(
                        asset = %shared.asset,
                        id = withdrawal.id,
                        "SENT withdrawal has no tx hash, not watching it"
                    );
                }
            },
            Stage::Inchain => {}
        }
    }

    metrics::set_queue_size(&shared.asset, "pending_send", pending.len());
    metrics::set_queue_size(&shared.asset, "watch", watch.len());

    info!(
        asset = %shared.asset,
        pending = report.pending,
        watching = report.watching,
        repaired = report.repaired,
        "Recovered unfinished withdrawals"
    );

    Ok(report)
}

/// Rewrite the process record of `withdrawal` when it is missing or lags the
/// stored stage. Returns whether a record was written.
async fn repair_process(shared: &Shared, withdrawal: &PersistedWithdrawal) -> Result<bool> {
    let current = shared
        .store
        .get_process(&withdrawal.asset, ProcessType::Withdraw, withdrawal.id)
        .await
        .wrap_err_with(|| format!("Failed to load process record of withdrawal {}", withdrawal.id))?;
    if current.is_some_and(|record| record.stage == withdrawal.stage) {
        return Ok(false);
    }

    warn!(
        asset = %withdrawal.asset,
        id = withdrawal.id,
        stage = %withdrawal.stage,
        "Process record disagrees with stored withdrawal, rewriting it"
    );
    shared
        .store
        .save_process(&ProcessRecord::from_withdrawal(withdrawal, shared.stable_depth))
        .await
        .wrap_err_with(|| format!("Failed to repair process record of withdrawal {}", withdrawal.id))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::config::WithdrawConfig;
    use crate::db::memory::FailPoint;
    use crate::db::{MemoryStore, WithdrawalStore};
    use crate::rpc::RpcRegistry;
    use crate::types::{PersistedWithdrawal, ProcessRecord, Stage};
    use crate::withdraw::test_support::{request, ScriptedRpc};
    use crate::withdraw::{RecoveryReport, WithdrawCoordinator};

    fn coordinator(store: Arc<MemoryStore>) -> WithdrawCoordinator {
        let mut registry = RpcRegistry::new();
        registry.register("BTC", Arc::new(ScriptedRpc::default()));
        let (notify_tx, _) = mpsc::channel(8);
        WithdrawCoordinator::new("BTC", 6, WithdrawConfig::default(), store, &registry, notify_tx)
            .unwrap()
    }

    #[tokio::test]
    async fn test_recovery_splits_by_stage() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(1)))
            .await
            .unwrap();
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(2)))
            .await
            .unwrap();
        store.mark_sent("BTC", 2, "h2").await.unwrap();

        let mut coordinator = coordinator(store);
        let report = coordinator.recover().await.unwrap();

        assert_eq!(
            report,
            RecoveryReport {
                pending: 1,
                watching: 1,
                repaired: 2
            }
        );
        let handle = coordinator.handle();
        assert_eq!(handle.pending_ids().await, vec![1]);
        let watched = handle.watched().await;
        assert_eq!(watched.len(), 1);
        assert_eq!(watched.get("h2"), Some(&0));
    }

    #[tokio::test]
    async fn test_recovery_rewrites_lagging_process_record() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(9)))
            .await
            .unwrap();
        store
            .save_process(&ProcessRecord::withdraw(9, "BTC", Stage::Load))
            .await
            .unwrap();
        store.mark_sent("BTC", 9, "h9").await.unwrap();
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(10)))
            .await
            .unwrap();
        store
            .save_process(&ProcessRecord::withdraw(10, "BTC", Stage::Load))
            .await
            .unwrap();

        let mut coordinator = coordinator(store.clone());
        let report = coordinator.recover().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(report.watching, 1);

        let records = store.processes();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 9);
        assert_eq!(records[0].stage, Stage::Sent);
        assert!(!records[0].cancelable);
        assert_eq!(records[0].tx_hash.as_deref(), Some("h9"));
        assert_eq!(records[1].stage, Stage::Load);
        assert!(records[1].cancelable);
    }

    #[tokio::test]
    async fn test_recovery_skips_finished() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(3)))
            .await
            .unwrap();
        store.mark_sent("BTC", 3, "h3").await.unwrap();
        store.mark_in_chain("BTC", "h3", 100, 0).await.unwrap();

        let mut coordinator = coordinator(store);
        let report = coordinator.recover().await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_recovery_error_propagates() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(FailPoint::UnfinishedWithdrawals, 1);

        let mut coordinator = coordinator(store);
        assert!(coordinator.recover().await.is_err());
        assert!(coordinator.spawn().is_err());
    }

    #[tokio::test]
    async fn test_recovery_runs_once() {
        let mut coordinator = coordinator(Arc::new(MemoryStore::new()));
        coordinator.recover().await.unwrap();
        assert!(coordinator.recover().await.is_err());
    }
}
