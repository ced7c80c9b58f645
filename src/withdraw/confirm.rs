//! Confirmation stage: detect chain inclusion of broadcast withdrawals

use eyre::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Shared;
use crate::metrics;
use crate::rpc::RpcError;
use crate::types::{ProcessRecord, Stage, TransferDetail};

pub(crate) struct Confirmer {
    shared: Arc<Shared>,
    notify_tx: mpsc::Sender<TransferDetail>,
    progress_log_every: u64,
}

impl Confirmer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        notify_tx: mpsc::Sender<TransferDetail>,
        progress_log_every: u64,
    ) -> Self {
        Self {
            shared,
            notify_tx,
            progress_log_every: progress_log_every.max(1),
        }
    }

    pub(crate) async fn run(self, interval: Duration) {
        info!(asset = %self.shared.asset, "Confirmation loop started");

        while self.shared.is_active() {
            self.pass().await;
            self.shared.pause(interval).await;
        }

        self.shared.destroy();
        info!(asset = %self.shared.asset, "Confirmation loop stopped");
    }

    /// One scan over the watch set. At most one hash is concluded per pass;
    /// returns it once its transfers have been committed and forwarded.
    pub(crate) async fn pass(&self) -> Option<String> {
        let shared = &self.shared;

        let included = {
            let watch = shared.watch.read().await;
            let mut included = None;

            for tx_hash in watch.hashes() {
                let started = Instant::now();
                let height = shared.rpc.inclusion_height(&tx_hash).await;
                metrics::record_rpc_latency(
                    &shared.asset,
                    "inclusion_height",
                    started.elapsed().as_secs_f64(),
                );

                let height = match height {
                    Ok(height) => height,
                    Err(e) => {
                        warn!(
                            asset = %shared.asset,
                            %tx_hash,
                            error = %e,
                            "Failed to query inclusion height"
                        );
                        metrics::record_error(&shared.asset, "confirm", "rpc");
                        continue;
                    }
                };

                if height == 0 {
                    let polls = watch.bump(&tx_hash).unwrap_or(0) + 1;
                    if polls % self.progress_log_every == 0 {
                        info!(asset = %shared.asset, %tx_hash, polls, "Still waiting for inclusion");
                    }
                    continue;
                }

                let details = match self.fetch_details(&tx_hash).await {
                    Ok(details) => details,
                    Err(e) => {
                        warn!(
                            asset = %shared.asset,
                            %tx_hash,
                            height,
                            error = %e,
                            "Failed to fetch transfer details, will retry"
                        );
                        metrics::record_error(&shared.asset, "confirm", "rpc");
                        continue;
                    }
                };

                match self.commit_inclusion(&tx_hash, height, details).await {
                    Ok(forward) => {
                        included = Some((tx_hash, forward));
                        break;
                    }
                    Err(e) => {
                        error!(
                            asset = %shared.asset,
                            %tx_hash,
                            height,
                            error = %e,
                            "Failed to record inclusion, will retry"
                        );
                        metrics::record_error(&shared.asset, "confirm", "store");
                    }
                }
            }
            included
        };

        let (tx_hash, details) = included?;

        for detail in details {
            if self.notify_tx.send(detail).await.is_err() {
                error!(
                    asset = %shared.asset,
                    %tx_hash,
                    "Downstream notifier is gone, stopping pipeline"
                );
                shared.destroy();
                break;
            }
        }

        {
            let mut watch = shared.watch.write().await;
            watch.remove(&tx_hash);
            metrics::set_queue_size(&shared.asset, "watch", watch.len());
        }

        Some(tx_hash)
    }

    async fn fetch_details(&self, tx_hash: &str) -> Result<Vec<TransferDetail>, RpcError> {
        let started = Instant::now();
        let details = self.shared.rpc.fetch_transaction(tx_hash).await;
        metrics::record_rpc_latency(
            &self.shared.asset,
            "fetch_transaction",
            started.elapsed().as_secs_f64(),
        );
        details
    }

    /// Persist INCHAIN for every transfer of `tx_hash`, returning the
    /// transfers to forward downstream. A hash without transfer details is
    /// committed at index 0 and forwards nothing.
    async fn commit_inclusion(
        &self,
        tx_hash: &str,
        height: u64,
        details: Vec<TransferDetail>,
    ) -> Result<Vec<TransferDetail>> {
        let shared = &self.shared;
        let asset = shared.asset.as_str();

        if details.is_empty() {
            debug!(%asset, %tx_hash, "Transaction carries no outgoing transfer details");
            shared.store.mark_in_chain(asset, tx_hash, height, 0).await?;
        }

        let mut forward = Vec::with_capacity(details.len());
        for mut detail in details {
            if detail.height == 0 {
                detail.height = height;
            }
            shared
                .store
                .mark_in_chain(asset, tx_hash, height, detail.tx_index)
                .await?;
            forward.push(detail);
        }

        if !self.record_inchain(tx_hash, height).await? {
            forward.clear();
        }
        Ok(forward)
    }

    /// Save the INCHAIN process record of the withdrawal owning `tx_hash`.
    /// Returns false when no withdrawal owns the hash.
    async fn record_inchain(&self, tx_hash: &str, height: u64) -> Result<bool> {
        let shared = &self.shared;
        let Some(id) = shared
            .store
            .withdrawal_id_by_tx_hash(&shared.asset, tx_hash)
            .await?
        else {
            warn!(asset = %shared.asset, %tx_hash, "No withdrawal owns included tx");
            return Ok(false);
        };

        shared
            .store
            .save_process(
                &ProcessRecord::withdraw(id, &shared.asset, Stage::Inchain)
                    .with_tx_hash(tx_hash)
                    .with_height(height, shared.stable_depth),
            )
            .await?;

        info!(
            asset = %shared.asset,
            id,
            %tx_hash,
            height,
            complete_height = height + shared.stable_depth,
            "Withdrawal included in block"
        );
        metrics::record_inchain(&shared.asset);
        Ok(true)
    }
}
