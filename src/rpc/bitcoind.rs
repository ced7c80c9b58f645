//! JSON-RPC client for bitcoind-compatible wallet nodes
//!
//! Read-only calls fall back through the configured URLs in order. Sends only
//! ever go to the primary URL: retrying a send on another node after a lost
//! response would broadcast the payment twice.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChainRpc, RpcError};
use crate::config::CoinConfig;
use crate::types::TransferDetail;

/// JSON-RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<NodeError>,
}

#[derive(Debug, Deserialize)]
struct NodeError {
    code: i64,
    message: String,
}

/// Subset of the `gettransaction` result
#[derive(Debug, Deserialize)]
struct WalletTransaction {
    #[serde(default)]
    confirmations: i64,
    #[serde(default)]
    blockhash: Option<String>,
    #[serde(default)]
    blockheight: Option<u64>,
    #[serde(default)]
    details: Vec<WalletTransactionDetail>,
}

#[derive(Debug, Deserialize)]
struct WalletTransactionDetail {
    #[serde(default)]
    address: Option<String>,
    category: String,
    amount: Value,
    #[serde(default)]
    vout: u32,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    height: u64,
}

/// Subset of the `validateaddress` result
#[derive(Debug, Deserialize)]
struct AddressValidation {
    isvalid: bool,
}

pub struct BitcoindRpc {
    asset: String,
    urls: Vec<String>,
    credentials: Option<(String, String)>,
    client: Client,
}

impl BitcoindRpc {
    pub fn new(config: &CoinConfig) -> Result<Self, RpcError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let credentials = match (&config.rpc_user, &config.rpc_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            asset: config.name.clone(),
            urls: config.all_rpc_urls(),
            credentials,
            client,
        })
    }

    async fn call_url<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        method: &str,
        params: &Value,
    ) -> Result<T, RpcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "withdrawer",
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(url).json(&body);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }

        // bitcoind answers errors with HTTP 500 and a JSON body, so the status
        // code is not checked before decoding
        let response = request.send().await?.json::<RpcResponse<T>>().await?;

        if let Some(error) = response.error {
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }
        response
            .result
            .ok_or_else(|| RpcError::InvalidResponse(format!("{} returned no result", method)))
    }

    /// Read-only call with URL fallback on transport errors
    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let mut last_error = RpcError::Transport("no RPC URLs configured".to_string());
        for url in &self.urls {
            match self.call_url(url, method, &params).await {
                Ok(result) => return Ok(result),
                Err(RpcError::Transport(e)) => {
                    warn!(url = %url, method, error = %e, "RPC endpoint failed, trying next");
                    last_error = RpcError::Transport(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    async fn wallet_transaction(&self, tx_hash: &str) -> Result<WalletTransaction, RpcError> {
        self.call("gettransaction", json!([tx_hash])).await
    }

    /// Inclusion height of a wallet transaction, 0 while unconfirmed
    async fn height_of(&self, tx: &WalletTransaction) -> Result<u64, RpcError> {
        if tx.confirmations <= 0 {
            return Ok(0);
        }
        if let Some(height) = tx.blockheight {
            return Ok(height);
        }
        let block_hash = tx.blockhash.as_deref().ok_or_else(|| {
            RpcError::InvalidResponse("confirmed transaction without blockhash".to_string())
        })?;
        let header: BlockHeader = self.call("getblockheader", json!([block_hash])).await?;
        Ok(header.height)
    }
}

/// Outgoing transfers of a wallet transaction
fn outgoing_transfers(
    asset: &str,
    tx_hash: &str,
    height: u64,
    tx: &WalletTransaction,
) -> Result<Vec<TransferDetail>, RpcError> {
    tx.details
        .iter()
        .filter(|d| d.category == "send")
        .map(|d| {
            let amount = BigDecimal::from_str(&d.amount.to_string())
                .map_err(|e| RpcError::InvalidResponse(format!("bad amount {}: {}", d.amount, e)))?
                .abs();
            Ok(TransferDetail {
                asset: asset.to_string(),
                tx_hash: tx_hash.to_string(),
                address: d.address.clone().unwrap_or_default(),
                amount,
                height,
                tx_index: d.vout,
            })
        })
        .collect()
}

#[async_trait]
impl ChainRpc for BitcoindRpc {
    async fn send_to(&self, address: &str, amount: &BigDecimal) -> Result<String, RpcError> {
        let primary = self
            .urls
            .first()
            .ok_or_else(|| RpcError::Transport("no RPC URLs configured".to_string()))?;
        // Amount goes over the wire as a decimal string so no precision is lost
        let tx_hash: String = self
            .call_url(primary, "sendtoaddress", &json!([address, amount.to_string()]))
            .await?;
        debug!(asset = %self.asset, %address, %tx_hash, "sendtoaddress returned");
        Ok(tx_hash)
    }

    async fn inclusion_height(&self, tx_hash: &str) -> Result<u64, RpcError> {
        let tx = self.wallet_transaction(tx_hash).await?;
        self.height_of(&tx).await
    }

    async fn fetch_transaction(&self, tx_hash: &str) -> Result<Vec<TransferDetail>, RpcError> {
        let tx = self.wallet_transaction(tx_hash).await?;
        let height = self.height_of(&tx).await?;
        outgoing_transfers(&self.asset, tx_hash, height, &tx)
    }

    async fn validate_address(&self, address: &str) -> Result<bool, RpcError> {
        let validation: AddressValidation =
            self.call("validateaddress", json!([address])).await?;
        Ok(validation.isvalid)
    }
}
