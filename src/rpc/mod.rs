//! Chain RPC capability used by the withdrawal pipeline
//!
//! Each served asset registers one [`ChainRpc`] implementation in an
//! [`RpcRegistry`]. Lookups for unregistered assets are a checked error.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::types::TransferDetail;

pub mod bitcoind;

pub use bitcoind::BitcoindRpc;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no RPC registered for asset {0}")]
    UnknownAsset(String),

    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC error: {code} - {message}")]
    Node { code: i64, message: String },

    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Whether retrying the same call later can reasonably succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Node { message, .. } => {
                let message = message.to_lowercase();
                message.contains("timeout")
                    || message.contains("loading")
                    || message.contains("warming up")
                    || message.contains("rate limit")
                    || message.contains("temporarily unavailable")
            }
            RpcError::UnknownAsset(_) | RpcError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(e: reqwest::Error) -> Self {
        RpcError::Transport(e.to_string())
    }
}

/// Send/query capability against one chain
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Broadcast a payment. An empty hash is a valid, ambiguous outcome.
    async fn send_to(&self, address: &str, amount: &BigDecimal) -> Result<String, RpcError>;

    /// Height of the block that includes `tx_hash`, 0 when not yet included
    async fn inclusion_height(&self, tx_hash: &str) -> Result<u64, RpcError>;

    /// Logical transfers carried by `tx_hash`
    async fn fetch_transaction(&self, tx_hash: &str) -> Result<Vec<TransferDetail>, RpcError>;

    /// Whether the node accepts `address` as a payment destination
    async fn validate_address(&self, address: &str) -> Result<bool, RpcError>;
}

/// Explicit asset → RPC mapping
#[derive(Clone, Default)]
pub struct RpcRegistry {
    clients: HashMap<String, Arc<dyn ChainRpc>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` for `asset`; tickers are matched case-insensitively.
    pub fn register(&mut self, asset: &str, client: Arc<dyn ChainRpc>) -> &mut Self {
        self.clients.insert(asset.to_uppercase(), client);
        self
    }

    pub fn get(&self, asset: &str) -> Result<Arc<dyn ChainRpc>, RpcError> {
        self.clients
            .get(&asset.to_uppercase())
            .cloned()
            .ok_or_else(|| RpcError::UnknownAsset(asset.to_string()))
    }
}
