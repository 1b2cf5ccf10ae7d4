//! Trigger ingest and introspection endpoints.
//!
//! - `POST /tenants/:tenant_id/triggers`: register a trigger
//! - `GET  /tenants/:tenant_id/pending`: triggers waiting for retry
//! - `GET  /circuit`: breaker state and rolling counts
//! - `GET  /health`

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;

use relay_core::TenantId;
use relay_infra::circuit::CircuitBreaker;
use relay_infra::registry::TenantQueueRegistry;
use relay_infra::{TriggerDispatcher, TriggerOutcome, TriggerRelay};

use crate::dto::{PendingTriggerResponse, RegisterTriggerRequest, TriggerReceiptResponse};

/// Handles shared by every request.
#[derive(Clone)]
pub struct RelayHandles {
    pub dispatcher: TriggerDispatcher,
    pub registry: Arc<TenantQueueRegistry>,
    pub breaker: Arc<CircuitBreaker>,
}

impl RelayHandles {
    pub fn from_relay(relay: &TriggerRelay) -> Self {
        Self {
            dispatcher: relay.dispatcher().clone(),
            registry: Arc::clone(relay.registry()),
            breaker: Arc::clone(relay.breaker()),
        }
    }
}

pub fn router(handles: RelayHandles) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/circuit", get(circuit))
        .route("/tenants/:tenant_id/triggers", post(register_trigger))
        .route("/tenants/:tenant_id/pending", get(list_pending))
        .layer(ServiceBuilder::new().layer(Extension(handles)))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn circuit(Extension(handles): Extension<RelayHandles>) -> impl IntoResponse {
    Json(handles.breaker.stats())
}

/// POST /tenants/:tenant_id/triggers
pub async fn register_trigger(
    Extension(handles): Extension<RelayHandles>,
    Path(tenant_id): Path<String>,
    Json(body): Json<RegisterTriggerRequest>,
) -> axum::response::Response {
    let tenant_id = match parse_tenant(&tenant_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let trigger = match body.into_trigger() {
        Ok(t) => t,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    };

    match handles.dispatcher.register_trigger(tenant_id, trigger).await {
        Ok(receipt) => {
            let status = match receipt.outcome {
                TriggerOutcome::Delivered(_) => StatusCode::OK,
                TriggerOutcome::Queued => StatusCode::ACCEPTED,
                TriggerOutcome::Dropped => StatusCode::UNPROCESSABLE_ENTITY,
                TriggerOutcome::Lost => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(TriggerReceiptResponse::from(receipt))).into_response()
        }
        Err(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
    }
}

/// GET /tenants/:tenant_id/pending
pub async fn list_pending(
    Extension(handles): Extension<RelayHandles>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id = match parse_tenant(&tenant_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(queue) = handles.registry.queue(tenant_id) else {
        return json_error(StatusCode::NOT_FOUND, "not_found", "no queue for tenant");
    };

    let pending: Vec<PendingTriggerResponse> = queue
        .pending()
        .await
        .into_iter()
        .map(PendingTriggerResponse::from)
        .collect();
    Json(pending).into_response()
}

fn parse_tenant(raw: &str) -> Result<TenantId, axum::response::Response> {
    raw.parse::<TenantId>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_tenant_id", "tenant id must be a UUID"))
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
