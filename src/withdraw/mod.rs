//! Withdrawal lifecycle coordinator
//!
//! Drives every withdrawal of one asset through LOAD → SENT → INCHAIN:
//!
//! - intake: persists inbound requests and queues them for broadcast
//! - dispatch: broadcasts queued withdrawals, at most one commit per pass
//! - confirmation: polls inclusion of broadcast hashes and hands the
//!   transfers to the downstream notifier
//!
//! Unfinished withdrawals are reloaded from the store once before the loops
//! start. Cancellation removes a withdrawal from the in-memory queues on
//! demand through a [`CoordinatorHandle`].

use eyre::{eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::WithdrawConfig;
use crate::db::WithdrawalStore;
use crate::metrics;
use crate::rpc::{ChainRpc, RpcError, RpcRegistry};
use crate::types::{TransferDetail, WithdrawalRequest};

mod cancel;
mod confirm;
mod dispatch;
mod intake;
mod queues;
mod recovery;
mod submit;

pub use cancel::CancelOutcome;
pub use queues::{PendingSendSet, WatchSet};
pub use recovery::RecoveryReport;
pub use submit::{SubmitError, Submitter, WithdrawalSubmission};

use confirm::Confirmer;
use dispatch::Dispatcher;

/// Shared run-state of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Active,
    Destroy,
}

/// State shared by all stages of one coordinator
pub(crate) struct Shared {
    pub(crate) asset: String,
    pub(crate) stable_depth: u64,
    pub(crate) store: Arc<dyn WithdrawalStore>,
    pub(crate) rpc: Arc<dyn ChainRpc>,
    pub(crate) pending: RwLock<PendingSendSet>,
    pub(crate) watch: RwLock<WatchSet>,
    /// Ids accepted by the submitter but not yet persisted by intake
    pub(crate) reserved: Mutex<HashSet<i64>>,
    /// Withdrawals broadcast successfully whose SENT commit has not landed yet
    pub(crate) unpersisted: Mutex<HashMap<i64, String>>,
    pub(crate) state: watch::Sender<RunState>,
}

impl Shared {
    pub(crate) fn is_active(&self) -> bool {
        *self.state.borrow() == RunState::Active
    }

    /// Drive the run-state to Destroy; every loop exits at its next check
    pub(crate) fn destroy(&self) {
        self.state.send_if_modified(|state| {
            if *state == RunState::Destroy {
                return false;
            }
            *state = RunState::Destroy;
            true
        });
    }

    /// Sleep for `interval`, returning early when the run-state leaves Active
    pub(crate) async fn pause(&self, interval: Duration) {
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = state.wait_for(|s| *s != RunState::Active) => {}
        }
    }

    pub(crate) fn reserved(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.reserved.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn unpersisted(&self) -> MutexGuard<'_, HashMap<i64, String>> {
        self.unpersisted.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move a committed withdrawal from the pending set to the watch set.
    ///
    /// Both write locks are held together (pending first, then watch), so no
    /// reader observes the withdrawal in neither or both queues.
    pub(crate) async fn move_to_watch(&self, id: i64, tx_hash: String) {
        let mut pending = self.pending.write().await;
        let mut watch = self.watch.write().await;
        watch.insert(tx_hash);
        pending.remove(&self.asset, id);
        metrics::set_queue_size(&self.asset, "pending_send", pending.len());
        metrics::set_queue_size(&self.asset, "watch", watch.len());
    }
}

/// Owns the queues and channels of one asset's withdrawal pipeline.
///
/// Built once at process start; hand [`Submitter`] and [`CoordinatorHandle`]
/// clones to whoever needs to enqueue or cancel withdrawals.
pub struct WithdrawCoordinator {
    shared: Arc<Shared>,
    config: WithdrawConfig,
    inbound_tx: mpsc::Sender<WithdrawalRequest>,
    inbound_rx: mpsc::Receiver<WithdrawalRequest>,
    notify_tx: mpsc::Sender<TransferDetail>,
    recovered: bool,
}

impl WithdrawCoordinator {
    /// Create the coordinator for `asset`, resolving its RPC from `registry`.
    ///
    /// Resolved transfers are pushed to `notify_tx` once included in a block.
    pub fn new(
        asset: &str,
        stable_depth: u64,
        config: WithdrawConfig,
        store: Arc<dyn WithdrawalStore>,
        registry: &RpcRegistry,
        notify_tx: mpsc::Sender<TransferDetail>,
    ) -> Result<Self, RpcError> {
        let asset = asset.to_uppercase();
        let rpc = registry.get(&asset)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size.max(1));
        let (state, _) = watch::channel(RunState::Init);

        let shared = Arc::new(Shared {
            asset,
            stable_depth,
            store,
            rpc,
            pending: RwLock::new(PendingSendSet::default()),
            watch: RwLock::new(WatchSet::default()),
            reserved: Mutex::new(HashSet::new()),
            unpersisted: Mutex::new(HashMap::new()),
            state,
        });

        Ok(Self {
            shared,
            config,
            inbound_tx,
            inbound_rx,
            notify_tx,
            recovered: false,
        })
    }

    pub fn asset(&self) -> &str {
        &self.shared.asset
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn submitter(&self) -> Submitter {
        Submitter::new(Arc::clone(&self.shared), self.inbound_tx.clone())
    }

    /// Reload unfinished withdrawals from the store. Must run exactly once,
    /// before [`spawn`](Self::spawn); a failure here must abort startup.
    pub async fn recover(&mut self) -> Result<RecoveryReport> {
        if self.recovered {
            return Err(eyre!("recovery already ran for {}", self.shared.asset));
        }
        let report = recovery::load_unfinished(&self.shared).await?;
        self.recovered = true;
        Ok(report)
    }

    /// Start intake, dispatch and confirmation as concurrent tasks
    pub fn spawn(self) -> Result<RunningCoordinator> {
        if !self.recovered {
            return Err(eyre!(
                "recovery must complete before the {} pipeline starts",
                self.shared.asset
            ));
        }

        let WithdrawCoordinator {
            shared,
            config,
            inbound_tx,
            inbound_rx,
            notify_tx,
            ..
        } = self;
        // Only submitters keep the inbound queue open from here on
        drop(inbound_tx);

        shared.state.send_replace(RunState::Active);

        let mut tasks = JoinSet::new();
        tasks.spawn(intake::run(Arc::clone(&shared), inbound_rx));
        tasks.spawn(
            Dispatcher::new(Arc::clone(&shared), config.empty_hash_backoff_passes)
                .run(config.dispatch_poll_interval()),
        );
        tasks.spawn(
            Confirmer::new(Arc::clone(&shared), notify_tx, config.progress_log_every)
                .run(config.confirm_poll_interval()),
        );

        info!(asset = %shared.asset, "Withdrawal pipeline started");

        Ok(RunningCoordinator {
            handle: CoordinatorHandle { shared },
            tasks,
        })
    }
}

/// The three running stages of a spawned coordinator
pub struct RunningCoordinator {
    handle: CoordinatorHandle,
    tasks: JoinSet<()>,
}

impl RunningCoordinator {
    pub fn handle(&self) -> CoordinatorHandle {
        self.handle.clone()
    }

    /// Wait until every stage has exited
    pub async fn wait(mut self) -> Result<()> {
        let mut panicked = 0;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Withdrawal pipeline task panicked");
                self.handle.shared.destroy();
                panicked += 1;
            }
        }
        info!(asset = %self.handle.shared.asset, "Withdrawal pipeline stopped");
        if panicked > 0 {
            return Err(eyre!("{} withdrawal pipeline task(s) panicked", panicked));
        }
        Ok(())
    }
}

/// Cloneable handle for inspection, cancellation and shutdown
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub(crate) shared: Arc<Shared>,
}

impl CoordinatorHandle {
    pub fn asset(&self) -> &str {
        &self.shared.asset
    }

    pub fn state(&self) -> RunState {
        *self.shared.state.borrow()
    }

    /// Stop all stages
    pub fn shutdown(&self) {
        self.shared.destroy();
    }

    /// Ids waiting for broadcast, in order
    pub async fn pending_ids(&self) -> Vec<i64> {
        self.shared.pending.read().await.ids()
    }

    /// Watched hashes with their poll counts
    pub async fn watched(&self) -> HashMap<String, u64> {
        self.shared.watch.read().await.snapshot()
    }

    /// Remove (asset, id) from the in-memory queues. See [`cancel`](Self::cancel)
    /// for the full administrative flow.
    pub async fn remove_in_flight(&self, asset: &str, id: i64) -> bool {
        cancel::remove_in_flight(&self.shared, asset, id).await
    }

    /// Cancel a withdrawal that has not been broadcast yet, deleting its
    /// persisted records
    pub async fn cancel(&self, asset: &str, id: i64) -> Result<CancelOutcome> {
        cancel::cancel(&self.shared, asset, id).await
    }
}
