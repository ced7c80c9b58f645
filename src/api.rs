//! HTTP surface of the withdrawer
//!
//! - POST   /api/withdraw/{asset}          - submit a withdrawal
//! - GET    /api/withdraw/{asset}          - list withdrawals (?id=&tx_hash=)
//! - GET    /api/withdraw/{asset}/valid_address/{address} - ask the node
//!   whether an address is a valid destination
//! - DELETE /api/withdraw/{asset}/id/{id}  - cancel a withdrawal not yet sent
//! - GET    /health                        - pipeline status (JSON)
//! - GET    /metrics                       - Prometheus metrics

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use bigdecimal::BigDecimal;
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::db::{WithdrawalFilter, WithdrawalStore};
use crate::types::PersistedWithdrawal;
use crate::withdraw::{
    CancelOutcome, CoordinatorHandle, RunState, SubmitError, Submitter, WithdrawalSubmission,
};

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub submitter: Submitter,
    pub handle: CoordinatorHandle,
    pub store: Arc<dyn WithdrawalStore>,
}

/// JSON error body with its status code
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(e: eyre::Report) -> Self {
        error!(error = %e, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let status = match &e {
            SubmitError::UnsupportedAsset { .. }
            | SubmitError::MissingAmount
            | SubmitError::InvalidAmount(_)
            | SubmitError::MissingAddress
            | SubmitError::InvalidAddress(_)
            | SubmitError::InvalidId(_) => StatusCode::BAD_REQUEST,
            SubmitError::DuplicateId { .. } => StatusCode::CONFLICT,
            SubmitError::Rpc(_) => StatusCode::BAD_GATEWAY,
            SubmitError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Store(report) => {
                error!(error = %report, "Store error while submitting withdrawal");
                return Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
            }
        };
        Self::new(status, e.to_string())
    }
}

/// Submission body. `value` is a decimal, preferably sent as a string.
#[derive(Debug, Deserialize)]
pub struct WithdrawBody {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub value: Option<BigDecimal>,
    #[serde(default)]
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct WithdrawAccepted {
    pub id: i64,
    pub asset: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub id: Option<i64>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddressValidity {
    pub asset: String,
    pub address: String,
    pub valid: bool,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub asset: String,
    pub pending_send: usize,
    pub watching: usize,
}

async fn submit_withdrawal(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Json(body): Json<WithdrawBody>,
) -> Result<Json<WithdrawAccepted>, ApiError> {
    let request = state
        .submitter
        .submit(
            &asset,
            WithdrawalSubmission {
                id: body.id,
                amount: body.value,
                address: body.target,
            },
        )
        .await?;

    Ok(Json(WithdrawAccepted {
        id: request.id,
        asset: request.asset,
    }))
}

async fn list_withdrawals(
    State(state): State<AppState>,
    Path(asset): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PersistedWithdrawal>>, ApiError> {
    let filter = WithdrawalFilter {
        asset: asset.to_uppercase(),
        id: query.id,
        tx_hash: query.tx_hash.filter(|h| !h.is_empty()),
    };
    let withdrawals = state
        .store
        .list_withdrawals(&filter)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(withdrawals))
}

async fn validate_address(
    State(state): State<AppState>,
    Path((asset, address)): Path<(String, String)>,
) -> Result<Json<AddressValidity>, ApiError> {
    let valid = state.submitter.validate_address(&asset, &address).await?;
    Ok(Json(AddressValidity {
        asset: state.submitter.asset().to_string(),
        address,
        valid,
    }))
}

async fn cancel_withdrawal(
    State(state): State<AppState>,
    Path((asset, id)): Path<(String, i64)>,
) -> Result<Response, ApiError> {
    let outcome = state
        .handle
        .cancel(&asset, id)
        .await
        .map_err(ApiError::internal)?;

    let status = match &outcome {
        CancelOutcome::Cancelled => StatusCode::OK,
        CancelOutcome::NotCancelable { .. } | CancelOutcome::AlreadyBroadcast { .. } => {
            StatusCode::CONFLICT
        }
        CancelOutcome::NotFound => StatusCode::NOT_FOUND,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.handle.state() {
        RunState::Active => "healthy",
        RunState::Init => "starting",
        RunState::Destroy => "stopping",
    };
    Json(HealthResponse {
        status,
        asset: state.handle.asset().to_string(),
        pending_send: state.handle.pending_ids().await.len(),
        watching: state.handle.watched().await.len(),
    })
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/withdraw/{asset}",
            get(list_withdrawals).post(submit_withdrawal),
        )
        .route(
            "/api/withdraw/{asset}/valid_address/{address}",
            get(validate_address),
        )
        .route("/api/withdraw/{asset}/id/{id}", delete(cancel_withdrawal))
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the API until the listener fails
pub async fn start_server(bind_address: &str, port: u16, state: AppState) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, build_router(state)).await?;

    Ok(())
}
