//! Dispatch stage: broadcast pending withdrawals
//!
//! One pass scans the pending set in arrival order and commits at most one
//! successful broadcast. A send that returns an empty hash is ambiguous (the
//! node may or may not have broadcast it), so the withdrawal is held back for
//! a configured number of passes before it is tried again.

use eyre::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::Shared;
use crate::metrics;
use crate::types::{ProcessRecord, Stage, WithdrawalRequest};

pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    backoff_passes: u32,
    /// Withdrawal id → passes left to skip
    delays: HashMap<i64, u32>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<Shared>, backoff_passes: u32) -> Self {
        Self {
            shared,
            backoff_passes,
            delays: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, interval: Duration) {
        info!(asset = %self.shared.asset, "Dispatch loop started");

        while self.shared.is_active() {
            self.pass().await;
            self.shared.pause(interval).await;
        }

        self.shared.destroy();
        info!(asset = %self.shared.asset, "Dispatch loop stopped");
    }

    /// One scan over the pending set. Returns the (id, tx_hash) committed as
    /// SENT during this pass, if any.
    pub(crate) async fn pass(&mut self) -> Option<(i64, String)> {
        let shared = Arc::clone(&self.shared);

        let committed = {
            let pending = shared.pending.read().await;
            let mut committed = None;

            for request in pending.iter() {
                if self.held_back(request.id) {
                    continue;
                }
                if let Some(tx_hash) = self.try_dispatch(request).await {
                    committed = Some((request.id, tx_hash));
                    break;
                }
            }

            // Drop delays of ids that left the pending set
            let queued: HashSet<i64> = pending.iter().map(|r| r.id).collect();
            self.delays.retain(|id, _| queued.contains(id));
            committed
        };

        if let Some((id, tx_hash)) = &committed {
            shared.move_to_watch(*id, tx_hash.clone()).await;
        }
        committed
    }

    /// Whether the backoff for `id` still suppresses it this pass
    fn held_back(&mut self, id: i64) -> bool {
        let Some(remaining) = self.delays.get_mut(&id) else {
            return false;
        };
        if *remaining > 0 {
            *remaining -= 1;
            return true;
        }
        self.delays.remove(&id);
        false
    }

    /// Broadcast (or reuse an earlier broadcast of) `request` and commit it
    /// as SENT. Returns the hash once the commit landed.
    async fn try_dispatch(&mut self, request: &WithdrawalRequest) -> Option<String> {
        let shared = Arc::clone(&self.shared);
        let asset = &shared.asset;

        let earlier = shared.unpersisted().get(&request.id).cloned();
        let tx_hash = match earlier {
            Some(tx_hash) => {
                debug!(%asset, id = request.id, %tx_hash, "Retrying SENT commit of earlier broadcast");
                tx_hash
            }
            None => self.broadcast(request).await?,
        };

        match self.commit_sent(request, &tx_hash).await {
            Ok(()) => {
                shared.unpersisted().remove(&request.id);
                info!(
                    %asset,
                    id = request.id,
                    %tx_hash,
                    "Withdrawal sent"
                );
                Some(tx_hash)
            }
            Err(e) => {
                error!(
                    %asset,
                    id = request.id,
                    %tx_hash,
                    error = %e,
                    "Broadcast succeeded but SENT commit failed, will retry commit"
                );
                metrics::record_error(asset, "dispatch", "store");
                shared.unpersisted().insert(request.id, tx_hash);
                None
            }
        }
    }

    async fn broadcast(&mut self, request: &WithdrawalRequest) -> Option<String> {
        let asset = &self.shared.asset;
        let started = std::time::Instant::now();
        let result = self
            .shared
            .rpc
            .send_to(&request.address, &request.amount)
            .await;
        metrics::record_rpc_latency(asset, "send_to", started.elapsed().as_secs_f64());

        match result {
            Ok(tx_hash) if tx_hash.is_empty() => {
                warn!(
                    %asset,
                    id = request.id,
                    passes = self.backoff_passes,
                    "Send returned an empty tx hash, backing off"
                );
                metrics::record_broadcast(asset, "empty_hash");
                self.delays.insert(request.id, self.backoff_passes);
                None
            }
            Ok(tx_hash) => {
                metrics::record_broadcast(asset, "sent");
                Some(tx_hash)
            }
            Err(e) => {
                error!(
                    %asset,
                    id = request.id,
                    error = %e,
                    transient = e.is_transient(),
                    "Failed to send withdrawal"
                );
                metrics::record_broadcast(asset, "error");
                None
            }
        }
    }

    async fn commit_sent(&self, request: &WithdrawalRequest, tx_hash: &str) -> Result<()> {
        self.shared
            .store
            .mark_sent(&request.asset, request.id, tx_hash)
            .await?;
        self.shared
            .store
            .save_process(
                &ProcessRecord::withdraw(request.id, &request.asset, Stage::Sent)
                    .with_tx_hash(tx_hash),
            )
            .await
    }

    #[cfg(test)]
    pub(crate) fn remaining_delay(&self, id: i64) -> Option<u32> {
        self.delays.get(&id).copied()
    }
}
