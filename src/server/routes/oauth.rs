//! Authorize and callback endpoints for the per-service OAuth flows.
//!
//! The authorize URL carries `access_type=offline`, `prompt=consent`, the
//! service's default scopes, and a base64url state blob binding the flow to
//! an instance. The callback exchanges the code and persists tokens through
//! the store; the cache entry (if any) is invalidated so the next resolve
//! sees the new material.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use oauth2::RedirectUrl;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{OauthPatch, OauthStatus};
use crate::error::{CastorError, OauthError};
use crate::oauth::{ProviderOauth, StateBlob, TokenBundle};
use crate::server::router::CastorState;

pub fn router() -> Router<CastorState> {
    Router::new()
        .route("/oauth/{service}/authorize", get(oauth_authorize))
        .route("/oauth/{service}/callback", get(oauth_callback))
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    instance_id: Uuid,
    user_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: String,
    error: Option<String>,
}

fn flow_error(code: &str, message: String) -> CastorError {
    CastorError::Oauth(OauthError::Flow {
        code: code.to_string(),
        message,
        details: None,
    })
}

async fn oauth_authorize(
    State(state): State<CastorState>,
    Path(service): Path<String>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, CastorError> {
    let spec = state
        .registry
        .get_enabled(&service)
        .ok_or_else(|| flow_error("UNKNOWN_SERVICE", format!("service {service} unavailable")))?;
    if !spec.is_oauth() {
        return Err(flow_error(
            "NOT_OAUTH",
            format!("service {service} does not use OAuth"),
        ));
    }

    let instance = state
        .db
        .lookup_instance(query.instance_id)
        .await?
        .ok_or_else(|| flow_error("UNKNOWN_INSTANCE", "no such instance".to_string()))?;
    if instance.user_id != query.user_id || instance.service_name != service {
        return Err(flow_error(
            "INSTANCE_MISMATCH",
            "instance does not belong to this user and service".to_string(),
        ));
    }

    let redirect = callback_url(&state, &service)?;
    let provider = ProviderOauth::new(
        &spec,
        instance.client_id.as_deref(),
        instance.client_secret.as_deref(),
        Some(redirect),
    )?;

    let blob = StateBlob::new(instance.id, instance.user_id, service.clone());
    let url = provider.authorize_url(&blob)?;

    state
        .db
        .patch_oauth(
            instance.id,
            OauthPatch {
                oauth_status: Some(OauthStatus::Pending),
                ..Default::default()
            },
        )
        .await?;

    info!(instance_id = %instance.id, service = %service, "authorization flow started");
    Ok(Redirect::temporary(url.as_str()).into_response())
}

async fn oauth_callback(
    State(state): State<CastorState>,
    Path(service): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, CastorError> {
    let blob = StateBlob::decode(&query.state)?;
    if blob.service != service {
        return Err(flow_error(
            "INVALID_STATE",
            "state was issued for another service".to_string(),
        ));
    }
    if blob.is_stale() {
        return Err(flow_error(
            "STALE_STATE",
            "authorization flow took too long, start again".to_string(),
        ));
    }

    if let Some(err) = query.error {
        warn!(instance_id = %blob.instance_id, "provider returned error: {}", err);
        return Err(flow_error("PROVIDER_DENIED", err));
    }
    let code = query
        .code
        .ok_or_else(|| flow_error("MISSING_CODE", "callback carries no code".to_string()))?;

    let spec = state
        .registry
        .get_enabled(&service)
        .ok_or_else(|| flow_error("UNKNOWN_SERVICE", format!("service {service} unavailable")))?;
    let instance = state
        .db
        .lookup_instance(blob.instance_id)
        .await?
        .ok_or_else(|| flow_error("UNKNOWN_INSTANCE", "no such instance".to_string()))?;

    let redirect = callback_url(&state, &service)?;
    let provider = ProviderOauth::new(
        &spec,
        instance.client_id.as_deref(),
        instance.client_secret.as_deref(),
        Some(redirect),
    )?;

    let bundle: TokenBundle = provider
        .exchange_code(code, &state.oauth_client)
        .await
        .map_err(CastorError::Oauth)?;

    state
        .db
        .patch_oauth(
            instance.id,
            OauthPatch {
                oauth_status: Some(OauthStatus::Completed),
                access_token: Some(bundle.access_token),
                refresh_token: bundle.refresh_token,
                token_expires_at: Some(bundle.expires_at),
            },
        )
        .await?;
    state.resolver.cache().invalidate(instance.id);

    info!(instance_id = %instance.id, service = %service, "authorization completed");
    Ok(Json(json!({
        "status": "connected",
        "instance_id": instance.id,
        "service": service,
    }))
    .into_response())
}

fn callback_url(state: &CastorState, service: &str) -> Result<RedirectUrl, CastorError> {
    let url = format!("{}/oauth/{service}/callback", state.public_domain);
    Ok(RedirectUrl::new(url)?)
}
