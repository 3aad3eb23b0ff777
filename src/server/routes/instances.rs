//! Administrative instance controls. These sit behind the shared admin key
//! plus the lightweight instance gate (existence, not revoked); OAuth
//! completion is deliberately not required here.

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::error::CastorError;
use crate::server::guards::auth::GateInstance;
use crate::server::router::CastorState;

pub fn router() -> Router<CastorState> {
    Router::new()
        .route("/api/instances/{instance_id}/start", post(start_instance))
        .route("/api/instances/{instance_id}/stop", post(stop_instance))
        .route("/api/instances/{instance_id}/status", get(instance_status))
}

async fn start_instance(
    State(state): State<CastorState>,
    GateInstance(instance): GateInstance,
) -> Result<Json<Value>, CastorError> {
    let status = state.supervisor.start(instance.id).await?;
    Ok(Json(json!({ "instance_id": instance.id, "worker": status })))
}

async fn stop_instance(
    State(state): State<CastorState>,
    GateInstance(instance): GateInstance,
) -> Result<Json<Value>, CastorError> {
    state.supervisor.stop(instance.id).await?;
    Ok(Json(json!({ "instance_id": instance.id, "stopped": true })))
}

async fn instance_status(
    State(state): State<CastorState>,
    GateInstance(instance): GateInstance,
) -> Result<Json<Value>, CastorError> {
    let worker = state.supervisor.status(instance.id).await?;
    // Peek keeps the usage timestamp honest: a status check is not a use.
    let credential = state.resolver.cache().peek(instance.id).map(|entry| {
        json!({
            "cached_at": entry.cached_at,
            "expires_at": entry.expires_at,
            "last_used_at": entry.last_used_at(),
            "refresh_attempts": entry.refresh_attempts(),
        })
    });
    Ok(Json(json!({
        "instance_id": instance.id,
        "service": instance.service_name,
        "status": instance.status,
        "oauth_status": instance.oauth_status,
        "worker": worker,
        "credential": credential,
    })))
}
