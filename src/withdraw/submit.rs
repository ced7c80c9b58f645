//! Validation front of the inbound queue

use bigdecimal::{BigDecimal, Zero};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::Shared;
use crate::metrics;
use crate::rpc::RpcError;
use crate::types::WithdrawalRequest;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("asset {got} is not served here (expected {expected})")]
    UnsupportedAsset { expected: String, got: String },

    #[error("withdrawal amount is missing")]
    MissingAmount,

    #[error("withdrawal amount must be positive, got {0}")]
    InvalidAmount(BigDecimal),

    #[error("destination address is missing")]
    MissingAddress,

    #[error("destination address {0} is not valid")]
    InvalidAddress(String),

    #[error("withdrawal id must not be negative, got {0}")]
    InvalidId(i64),

    #[error("withdrawal {id} already exists for {asset}")]
    DuplicateId { asset: String, id: i64 },

    #[error("store error: {0}")]
    Store(eyre::Report),

    #[error("address validation failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("withdrawal pipeline is not accepting requests")]
    QueueClosed,
}

/// Unvalidated withdrawal as received from a caller. An id of 0 asks for the
/// next free id.
#[derive(Debug, Clone, Default)]
pub struct WithdrawalSubmission {
    pub id: i64,
    pub amount: Option<BigDecimal>,
    pub address: String,
}

/// Cloneable producer side of the inbound queue
#[derive(Clone)]
pub struct Submitter {
    shared: Arc<Shared>,
    inbound: mpsc::Sender<WithdrawalRequest>,
}

impl Submitter {
    pub(crate) fn new(shared: Arc<Shared>, inbound: mpsc::Sender<WithdrawalRequest>) -> Self {
        Self { shared, inbound }
    }

    pub fn asset(&self) -> &str {
        &self.shared.asset
    }

    /// Validate `submission`, reserve its id and hand it to intake.
    ///
    /// Nothing is queued unless every check passes. The id stays reserved
    /// until intake has persisted (or dropped) the request, so a concurrent
    /// submission of the same id is rejected as a duplicate.
    pub async fn submit(
        &self,
        asset: &str,
        submission: WithdrawalSubmission,
    ) -> Result<WithdrawalRequest, SubmitError> {
        let asset = self.served_asset(asset)?;

        let amount = match submission.amount {
            None => return Err(SubmitError::MissingAmount),
            Some(amount) if amount.is_zero() => return Err(SubmitError::MissingAmount),
            Some(amount) if amount < BigDecimal::zero() => {
                return Err(SubmitError::InvalidAmount(amount))
            }
            Some(amount) => amount,
        };

        let address = submission.address.trim().to_string();
        if address.is_empty() {
            return Err(SubmitError::MissingAddress);
        }
        if !self.check_address(&address).await? {
            return Err(SubmitError::InvalidAddress(address));
        }

        let id = match submission.id {
            id if id < 0 => return Err(SubmitError::InvalidId(id)),
            0 => self.reserve_next_id().await?,
            id => {
                self.reserve_id(id).await?;
                id
            }
        };

        let request = WithdrawalRequest {
            id,
            asset,
            amount,
            address,
        };
        debug!(asset = %request.asset, id, "Queueing withdrawal request");

        if self.inbound.send(request.clone()).await.is_err() {
            self.release(id);
            return Err(SubmitError::QueueClosed);
        }
        Ok(request)
    }

    /// Ask the node whether `address` is a valid destination for `asset`
    pub async fn validate_address(&self, asset: &str, address: &str) -> Result<bool, SubmitError> {
        self.served_asset(asset)?;
        self.check_address(address).await
    }

    fn served_asset(&self, asset: &str) -> Result<String, SubmitError> {
        let asset = asset.to_uppercase();
        if asset != self.shared.asset {
            return Err(SubmitError::UnsupportedAsset {
                expected: self.shared.asset.clone(),
                got: asset,
            });
        }
        Ok(asset)
    }

    async fn check_address(&self, address: &str) -> Result<bool, SubmitError> {
        let started = Instant::now();
        let result = self.shared.rpc.validate_address(address).await;
        metrics::record_rpc_latency(
            &self.shared.asset,
            "validate_address",
            started.elapsed().as_secs_f64(),
        );
        result.map_err(|e| {
            metrics::record_error(&self.shared.asset, "submit", "rpc");
            SubmitError::from(e)
        })
    }

    async fn reserve_id(&self, id: i64) -> Result<(), SubmitError> {
        let duplicate = || SubmitError::DuplicateId {
            asset: self.shared.asset.clone(),
            id,
        };

        if !self.shared.reserved().insert(id) {
            return Err(duplicate());
        }
        match self.shared.store.withdrawal_exists(&self.shared.asset, id).await {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.release(id);
                Err(duplicate())
            }
            Err(e) => {
                self.release(id);
                Err(SubmitError::Store(e))
            }
        }
    }

    async fn reserve_next_id(&self) -> Result<i64, SubmitError> {
        let mut id = self
            .shared
            .store
            .next_available_id(&self.shared.asset)
            .await
            .map_err(SubmitError::Store)?;

        loop {
            match self.reserve_id(id).await {
                Ok(()) => return Ok(id),
                Err(SubmitError::DuplicateId { .. }) => id += 1,
                Err(e) => return Err(e),
            }
        }
    }

    fn release(&self, id: i64) {
        self.shared.reserved().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    use crate::config::WithdrawConfig;
    use crate::db::{MemoryStore, WithdrawalStore};
    use crate::rpc::RpcRegistry;
    use crate::types::PersistedWithdrawal;
    use crate::withdraw::test_support::{request, ScriptedRpc};
    use crate::withdraw::WithdrawCoordinator;

    fn coordinator(store: Arc<MemoryStore>) -> WithdrawCoordinator {
        let mut registry = RpcRegistry::new();
        registry.register("BTC", Arc::new(ScriptedRpc::default()));
        let (notify_tx, _) = mpsc::channel(8);
        WithdrawCoordinator::new("BTC", 6, WithdrawConfig::default(), store, &registry, notify_tx)
            .unwrap()
    }

    fn submission(id: i64, amount: &str) -> WithdrawalSubmission {
        WithdrawalSubmission {
            id,
            amount: Some(BigDecimal::from_str(amount).unwrap()),
            address: "X".to_string(),
        }
    }

    #[tokio::test]
    async fn test_auto_id_follows_highest_stored() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(41)))
            .await
            .unwrap();
        let c = coordinator(store);

        let accepted = c.submitter().submit("btc", submission(0, "1.5")).await.unwrap();
        assert_eq!(accepted.id, 42);
        assert_eq!(accepted.asset, "BTC");

        // 42 is still reserved by the queued request
        let next = c.submitter().submit("BTC", submission(0, "2")).await.unwrap();
        assert_eq!(next.id, 43);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_withdrawal(&PersistedWithdrawal::from_request(&request(7)))
            .await
            .unwrap();
        let c = coordinator(store);
        let submitter = c.submitter();

        assert!(matches!(
            submitter.submit("BTC", submission(7, "1")).await,
            Err(SubmitError::DuplicateId { id: 7, .. })
        ));

        submitter.submit("BTC", submission(8, "1")).await.unwrap();
        assert!(matches!(
            submitter.submit("BTC", submission(8, "1")).await,
            Err(SubmitError::DuplicateId { id: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let c = coordinator(Arc::new(MemoryStore::new()));
        let submitter = c.submitter();

        assert!(matches!(
            submitter.submit("ETH", submission(1, "1")).await,
            Err(SubmitError::UnsupportedAsset { .. })
        ));
        assert!(matches!(
            submitter
                .submit(
                    "BTC",
                    WithdrawalSubmission {
                        id: 1,
                        amount: None,
                        address: "X".to_string()
                    }
                )
                .await,
            Err(SubmitError::MissingAmount)
        ));
        assert!(matches!(
            submitter.submit("BTC", submission(1, "0")).await,
            Err(SubmitError::MissingAmount)
        ));
        assert!(matches!(
            submitter.submit("BTC", submission(1, "-1")).await,
            Err(SubmitError::InvalidAmount(_))
        ));
        assert!(matches!(
            submitter
                .submit(
                    "BTC",
                    WithdrawalSubmission {
                        address: "  ".to_string(),
                        ..submission(1, "1")
                    }
                )
                .await,
            Err(SubmitError::MissingAddress)
        ));
        assert!(matches!(
            submitter.submit("BTC", submission(-3, "1")).await,
            Err(SubmitError::InvalidId(-3))
        ));

        // Rejected submissions leave no reservation behind
        submitter.submit("BTC", submission(1, "1")).await.unwrap();
    }

    fn coordinator_with(rpc: Arc<ScriptedRpc>) -> WithdrawCoordinator {
        let mut registry = RpcRegistry::new();
        registry.register("BTC", rpc);
        let (notify_tx, _) = mpsc::channel(8);
        WithdrawCoordinator::new(
            "BTC",
            6,
            WithdrawConfig::default(),
            Arc::new(MemoryStore::new()),
            &registry,
            notify_tx,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_before_reservation() {
        let rpc = Arc::new(ScriptedRpc::default());
        rpc.reject_address("nonsense");
        let c = coordinator_with(rpc);
        let submitter = c.submitter();

        assert!(matches!(
            submitter
                .submit(
                    "BTC",
                    WithdrawalSubmission {
                        address: "nonsense".to_string(),
                        ..submission(5, "1")
                    }
                )
                .await,
            Err(SubmitError::InvalidAddress(address)) if address == "nonsense"
        ));
        assert!(submitter.shared.reserved().is_empty());

        submitter.submit("BTC", submission(5, "1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_address() {
        let rpc = Arc::new(ScriptedRpc::default());
        rpc.reject_address("nonsense");
        let c = coordinator_with(rpc);
        let submitter = c.submitter();

        assert!(submitter.validate_address("btc", "X").await.unwrap());
        assert!(!submitter.validate_address("BTC", "nonsense").await.unwrap());
        assert!(matches!(
            submitter.validate_address("ETH", "X").await,
            Err(SubmitError::UnsupportedAsset { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_releases_reservation() {
        let c = coordinator(Arc::new(MemoryStore::new()));
        let submitter = c.submitter();
        // Spawning without recovery fails and drops the coordinator's receiver
        assert!(c.spawn().is_err());

        assert!(matches!(
            submitter.submit("BTC", submission(3, "1")).await,
            Err(SubmitError::QueueClosed)
        ));
        assert!(submitter.shared.reserved().is_empty());
    }
}
