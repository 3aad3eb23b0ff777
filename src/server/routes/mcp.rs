//! Tool-call forwarding: the request hits the auth gate, the supervisor
//! ensures the worker is up, and the body is relayed verbatim with the
//! resolved bearer attached. RPC payloads are never interpreted here.

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tracing::warn;

use crate::error::CastorError;
use crate::server::guards::auth::GateBearer;
use crate::server::router::CastorState;
use crate::supervisor::WorkerState;

pub fn router() -> Router<CastorState> {
    Router::new()
        .route("/{instance_id}/mcp/{service}/info", get(forward_info))
        .route("/{instance_id}/mcp/{service}/tools", get(forward_tools))
        .route("/{instance_id}/mcp/{service}/rpc", post(forward_rpc))
}

// The instance id stays a raw string here so the auth gate owns UUID
// validation and its 400 body; the gate re-reads the same path params.
async fn forward_info(
    State(state): State<CastorState>,
    Path((_, service)): Path<(String, String)>,
    GateBearer(bearer): GateBearer,
) -> Result<Response, CastorError> {
    forward(&state, &service, &bearer, "info", None).await
}

async fn forward_tools(
    State(state): State<CastorState>,
    Path((_, service)): Path<(String, String)>,
    GateBearer(bearer): GateBearer,
) -> Result<Response, CastorError> {
    forward(&state, &service, &bearer, "tools", None).await
}

async fn forward_rpc(
    State(state): State<CastorState>,
    Path((_, service)): Path<(String, String)>,
    GateBearer(bearer): GateBearer,
    body: Bytes,
) -> Result<Response, CastorError> {
    forward(&state, &service, &bearer, "rpc", Some(body)).await
}

async fn forward(
    state: &CastorState,
    service: &str,
    bearer: &crate::credentials::ResolvedCredential,
    tail: &str,
    body: Option<Bytes>,
) -> Result<Response, CastorError> {
    let instance_id = bearer.instance_id;
    // The path names the service; the instance row is authoritative.
    if bearer.service_name != service {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let status = state.supervisor.ensure_ready(instance_id).await?;
    if !matches!(status.state, WorkerState::Ready | WorkerState::Degraded) {
        warn!(%instance_id, state = ?status.state, "worker not serving, refusing forward");
        return Err(CastorError::WorkerNotRunning);
    }

    let url = format!(
        "http://127.0.0.1:{port}/{instance_id}/mcp/{service}/{tail}",
        port = status.port
    );
    let mut req = match body {
        Some(body) => state
            .forward_client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body),
        None => state.forward_client.get(&url),
    };
    req = req.bearer_auth(&bearer.access_token);

    let upstream = req.send().await?;
    let status_code = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let bytes = upstream.bytes().await?;

    Ok((
        status_code,
        [(header::CONTENT_TYPE, content_type)],
        bytes,
    )
        .into_response())
}
