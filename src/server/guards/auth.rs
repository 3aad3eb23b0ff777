use crate::db::{DbInstance, InstanceStatus};
use crate::error::ResolveError;
use crate::server::router::CastorState;
use axum::{
    Json, RequestPartsExt,
    extract::{FromRequestParts, Path},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use serde_json::json;
use std::collections::HashMap;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::credentials::ResolvedCredential;

fn extract_header_token(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(k) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(k.to_string());
    }
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

fn extract_query_token(query: Option<&str>) -> Option<String> {
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned())
    })
}

/// Shared-key guard for the administrative surface.
#[derive(Debug, Clone, Copy)]
pub struct RequireAdminKey;

impl FromRequestParts<CastorState> for RequireAdminKey {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &CastorState,
    ) -> Result<Self, Self::Rejection> {
        let token =
            extract_header_token(&parts.headers).or_else(|| extract_query_token(parts.uri.query()));

        match token {
            Some(key) => {
                let expected = state.castor_key.as_ref();
                if key.as_bytes().ct_eq(expected.as_bytes()).into() {
                    Ok(RequireAdminKey)
                } else {
                    Err(AuthError::InvalidKey)
                }
            }
            None => Err(AuthError::MissingKey),
        }
    }
}

pub enum AuthError {
    MissingKey,
    InvalidKey,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, reason) = match self {
            AuthError::MissingKey => (StatusCode::UNAUTHORIZED, "Missing API key"),
            AuthError::InvalidKey => (StatusCode::UNAUTHORIZED, "Invalid API key"),
        };
        (
            status,
            Json(json!({ "error": "unauthorized", "reason": reason })),
        )
            .into_response()
    }
}

/// Pull `instance_id` out of the matched path and insist it is a v4 UUID.
async fn path_instance_id(parts: &mut Parts) -> Result<Uuid, ResolveError> {
    let Path(params) = parts
        .extract::<Path<HashMap<String, String>>>()
        .await
        .map_err(|_| ResolveError::InvalidInstanceId)?;
    let raw = params
        .get("instance_id")
        .ok_or(ResolveError::InvalidInstanceId)?;
    let id = Uuid::parse_str(raw).map_err(|_| ResolveError::InvalidInstanceId)?;
    if id.get_version_num() != 4 {
        return Err(ResolveError::InvalidInstanceId);
    }
    Ok(id)
}

/// The auth gate: resolves a usable bearer for the `{instance_id}` path
/// parameter and hands it to the handler. `last_accessed_at` is updated
/// fire-and-forget; resolution failures map per the error taxonomy.
#[derive(Debug, Clone)]
pub struct GateBearer(pub ResolvedCredential);

impl FromRequestParts<CastorState> for GateBearer {
    type Rejection = ResolveError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &CastorState,
    ) -> Result<Self, Self::Rejection> {
        let instance_id = path_instance_id(parts).await?;
        let resolved = state.resolver.resolve(instance_id).await?;

        let db = state.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.touch_instance_usage(instance_id).await {
                tracing::debug!(%instance_id, "usage timestamp update failed: {}", e);
            }
        });

        Ok(GateBearer(resolved))
    }
}

/// Lightweight variant for the restricted admin route list: verifies the
/// instance exists and is not revoked, without requiring completed OAuth.
#[derive(Debug, Clone)]
pub struct GateInstance(pub DbInstance);

impl FromRequestParts<CastorState> for GateInstance {
    type Rejection = ResolveError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &CastorState,
    ) -> Result<Self, Self::Rejection> {
        let instance_id = path_instance_id(parts).await?;
        let instance = state
            .db
            .lookup_instance(instance_id)
            .await
            .map_err(ResolveError::Internal)?
            .ok_or(ResolveError::InstanceNotFound)?;
        if instance.status == InstanceStatus::Revoked {
            return Err(ResolveError::InstancePaused);
        }
        Ok(GateInstance(instance))
    }
}
