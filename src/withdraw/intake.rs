//! Intake stage: persist inbound requests and queue them for broadcast

use eyre::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{RunState, Shared};
use crate::metrics;
use crate::types::{PersistedWithdrawal, ProcessRecord, Stage, WithdrawalRequest};

/// Consume the inbound queue until it closes or the pipeline stops.
///
/// Closing the inbound queue stops the whole pipeline.
pub(crate) async fn run(shared: Arc<Shared>, mut inbound: mpsc::Receiver<WithdrawalRequest>) {
    let mut state = shared.state.subscribe();

    loop {
        let request = tokio::select! {
            request = inbound.recv() => request,
            _ = state.wait_for(|s| *s != RunState::Active) => break,
        };

        let Some(request) = request else {
            info!(asset = %shared.asset, "Inbound queue closed, stopping pipeline");
            break;
        };

        let id = request.id;
        if let Err(e) = accept(&shared, request).await {
            error!(
                asset = %shared.asset,
                id,
                error = %e,
                "Failed to persist withdrawal request, dropping it"
            );
            metrics::record_error(&shared.asset, "intake", "store");
        }
        shared.reserved().remove(&id);
    }

    shared.destroy();
}

/// Persist the request at LOAD and append it to the pending set.
///
/// The pending write lock is held across both writes so cancellation never
/// sees a persisted LOAD withdrawal that is missing from the pending set. If
/// the process record cannot be written the withdrawal row is deleted again,
/// leaving the id free for a resubmission.
pub(crate) async fn accept(shared: &Shared, request: WithdrawalRequest) -> Result<()> {
    let mut pending = shared.pending.write().await;
    shared
        .store
        .insert_withdrawal(&PersistedWithdrawal::from_request(&request))
        .await?;

    let process = ProcessRecord::withdraw(request.id, &request.asset, Stage::Load);
    if let Err(e) = shared.store.save_process(&process).await {
        if let Err(rollback) = shared.store.delete_withdrawal(&request.asset, request.id).await {
            error!(
                asset = %request.asset,
                id = request.id,
                error = %rollback,
                "Failed to delete withdrawal after process record write failed"
            );
        }
        return Err(e.wrap_err(format!(
            "Failed to save process record of withdrawal {}",
            request.id
        )));
    }

    info!(
        asset = %request.asset,
        id = request.id,
        amount = %request.amount,
        address = %request.address,
        "Withdrawal accepted"
    );

    pending.push(request);
    metrics::set_queue_size(&shared.asset, "pending_send", pending.len());
    metrics::record_received(&shared.asset);
    Ok(())
}
