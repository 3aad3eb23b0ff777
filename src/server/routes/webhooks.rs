//! Billing webhook intake. The gateway retries on anything but 200, so only
//! signature failures and malformed envelopes reject; handler failures are
//! recorded and acknowledged.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::json;

use crate::error::{ApiErrorBody, ApiErrorObject, CastorError};
use crate::server::router::CastorState;
use crate::webhooks::WebhookOutcome;

pub fn router() -> Router<CastorState> {
    Router::new().route("/billing/webhooks/{gateway}", post(receive_webhook))
}

async fn receive_webhook(
    State(state): State<CastorState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.webhooks.process(&gateway, &body, signature).await {
        Ok(WebhookOutcome::Processed) => Json(json!({ "status": "processed" })).into_response(),
        Ok(WebhookOutcome::Skipped) => Json(json!({ "status": "skipped" })).into_response(),
        // Business-logic failure: recorded, but acknowledged with 200 so the
        // sender does not retry.
        Ok(WebhookOutcome::Failed(_)) => Json(json!({ "status": "failed" })).into_response(),
        Err(CastorError::JsonError(e)) => (
            StatusCode::BAD_REQUEST,
            Json(ApiErrorBody {
                inner: ApiErrorObject {
                    code: "invalid_payload".to_string(),
                    message: format!("event payload is not valid JSON: {e}"),
                    details: None,
                },
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
