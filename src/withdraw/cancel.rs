//! Removal of withdrawals from the in-memory queues

use eyre::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{PendingSendSet, Shared};
use crate::metrics;
use crate::types::{ProcessRecord, ProcessType};

/// Result of an administrative cancellation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed from the queues and deleted from the store
    Cancelled,
    /// The withdrawal already left the cancelable stage
    NotCancelable { process: ProcessRecord },
    /// Broadcast succeeded but its SENT commit is still pending
    AlreadyBroadcast { tx_hash: String },
    NotFound,
}

/// Remove (asset, id) from the pending set or, failing that, the watch set
pub(crate) async fn remove_in_flight(shared: &Shared, asset: &str, id: i64) -> bool {
    let removed = {
        let mut pending = shared.pending.write().await;
        remove_pending(shared, &mut pending, asset, id)
    };
    removed || remove_watched(shared, asset, id).await
}

fn remove_pending(shared: &Shared, pending: &mut PendingSendSet, asset: &str, id: i64) -> bool {
    if pending.remove(asset, id).is_none() {
        return false;
    }
    metrics::set_queue_size(&shared.asset, "pending_send", pending.len());
    info!(%asset, id, "Removed withdrawal from pending set");
    true
}

async fn remove_watched(shared: &Shared, asset: &str, id: i64) -> bool {
    // Resolve owners before taking the write lock; store lookups must not
    // stall the confirmation stage.
    let hashes = shared.watch.read().await.hashes();
    let mut owned = None;
    for tx_hash in hashes {
        match shared.store.withdrawal_id_by_tx_hash(asset, &tx_hash).await {
            Ok(Some(owner)) if owner == id => {
                owned = Some(tx_hash);
                break;
            }
            Ok(Some(_)) => {}
            Ok(None) => warn!(%asset, %tx_hash, "Watched tx has no owning withdrawal"),
            Err(e) => warn!(%asset, %tx_hash, error = %e, "Failed to resolve watched tx owner"),
        }
    }

    let Some(tx_hash) = owned else {
        return false;
    };
    let mut watch = shared.watch.write().await;
    let removed = watch.remove(&tx_hash);
    if removed {
        metrics::set_queue_size(&shared.asset, "watch", watch.len());
        info!(%asset, id, %tx_hash, "Removed withdrawal from watch set");
    }
    removed
}

/// Cancel a withdrawal that has not been broadcast: drop it from the
/// in-memory queues and delete its withdrawal and process records.
///
/// The stored withdrawal stage is authoritative. A process record still
/// marked cancelable does not make a SENT withdrawal cancelable.
pub(crate) async fn cancel(shared: &Shared, asset: &str, id: i64) -> Result<CancelOutcome> {
    let asset = asset.to_uppercase();
    if asset != shared.asset {
        return Ok(CancelOutcome::NotFound);
    }

    // Holding the pending write lock keeps dispatch from starting a pass
    // while the stage is checked.
    let mut pending = shared.pending.write().await;

    if let Some(tx_hash) = shared.unpersisted().get(&id).cloned() {
        return Ok(CancelOutcome::AlreadyBroadcast { tx_hash });
    }

    let withdrawal = shared.store.get_withdrawal(&asset, id).await?;
    let process = shared
        .store
        .get_process(&asset, ProcessType::Withdraw, id)
        .await?;

    if withdrawal.is_none() && process.is_none() {
        return Ok(CancelOutcome::NotFound);
    }
    if let Some(withdrawal) = &withdrawal {
        if !withdrawal.stage.is_cancelable() {
            let process = match process {
                Some(process) if process.stage == withdrawal.stage => process,
                _ => {
                    warn!(
                        %asset,
                        id,
                        stage = %withdrawal.stage,
                        "Process record lags the stored withdrawal stage"
                    );
                    ProcessRecord::from_withdrawal(withdrawal, shared.stable_depth)
                }
            };
            return Ok(CancelOutcome::NotCancelable { process });
        }
    }
    if let Some(process) = process {
        if !process.cancelable {
            return Ok(CancelOutcome::NotCancelable { process });
        }
    }

    if !remove_pending(shared, &mut pending, &asset, id) {
        remove_watched(shared, &asset, id).await;
    }

    shared.store.delete_withdrawal(&asset, id).await?;
    shared
        .store
        .delete_process(&asset, ProcessType::Withdraw, id)
        .await?;
    drop(pending);

    metrics::record_cancelled(&asset);
    info!(%asset, id, "Withdrawal cancelled");
    Ok(CancelOutcome::Cancelled)
}
