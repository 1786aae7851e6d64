//! HTTP surface for the broker.
//!
//! Three routes over the coordinator plus a liveness probe. Validation
//! failures answer 400 with their specific message; upstream-node and
//! terminal failures answer 500 without leaking node internals.

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::store::{DurableStore, PendingStore};
use crate::types::Swap;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateSwapRequest {
    pub pubkey: String,
    pub value: u64,
    pub payment_hash: String,
}

#[derive(Debug, Deserialize)]
pub struct SettleParams {
    pub preimage: String,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

/// Error wrapper carrying the HTTP mapping.
pub struct ApiFailure(Error);

impl From<Error> for ApiFailure {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = if self.0.is_validation() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = match &self.0 {
            Error::ChainRpc(detail) => {
                log::error!("chain node failure: {}", detail);
                "chain node unavailable".to_string()
            }
            Error::LightningRpc(detail) => {
                log::error!("lightning node failure: {}", detail);
                "lightning node unavailable".to_string()
            }
            Error::Store(detail) => {
                log::error!("store failure: {}", detail);
                "store unavailable".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ApiError { error: message })).into_response()
    }
}

/// Build the API router over a coordinator.
pub fn router<P, D>(coordinator: Arc<Coordinator<P, D>>) -> Router
where
    P: PendingStore + 'static,
    D: DurableStore + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/create", post(create_swap::<P, D>))
        .route("/api/v1/settle/:swap_id", post(settle_swap::<P, D>))
        .route("/api/v1/lookup/:swap_id", get(lookup_swap::<P, D>))
        .with_state(coordinator)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_swap<P, D>(
    State(coordinator): State<Arc<Coordinator<P, D>>>,
    Json(request): Json<CreateSwapRequest>,
) -> Result<Json<Swap>, ApiFailure>
where
    P: PendingStore + 'static,
    D: DurableStore + 'static,
{
    let swap = coordinator
        .create(&request.pubkey, request.value, &request.payment_hash)
        .await?;
    Ok(Json(swap))
}

async fn settle_swap<P, D>(
    State(coordinator): State<Arc<Coordinator<P, D>>>,
    Path(swap_id): Path<String>,
    Query(params): Query<SettleParams>,
) -> Result<Json<Swap>, ApiFailure>
where
    P: PendingStore + 'static,
    D: DurableStore + 'static,
{
    let swap = coordinator.settle(&swap_id, &params.preimage).await?;
    Ok(Json(swap))
}

async fn lookup_swap<P, D>(
    State(coordinator): State<Arc<Coordinator<P, D>>>,
    Path(swap_id): Path<String>,
) -> Result<Json<Swap>, ApiFailure>
where
    P: PendingStore + 'static,
    D: DurableStore + 'static,
{
    let swap = coordinator.lookup(&swap_id).await?;
    Ok(Json(swap))
}
