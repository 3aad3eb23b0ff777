use axum::{Json, http::StatusCode, response::IntoResponse};
use thiserror::Error as ThisError;

use super::castor::{ApiErrorBody, ApiErrorObject, CastorError};

/// Outcomes of credential resolution surfaced to callers of the auth gate.
///
/// Each variant maps to a stable `{code, message}` body; transport and store
/// failures are wrapped in [`ResolveError::Internal`] and surface as 500.
#[derive(Debug, ThisError)]
pub enum ResolveError {
    #[error("instance id is not a valid UUID")]
    InvalidInstanceId,

    #[error("instance not found")]
    InstanceNotFound,

    #[error("service {0} is disabled")]
    ServiceDisabled(String),

    #[error("instance is not active")]
    InstancePaused,

    #[error("instance has no completed OAuth authorization")]
    OauthRequired,

    #[error("instance has no credential material")]
    NoCredential,

    #[error("re-authorization required")]
    ReauthRequired,

    #[error("token refresh failed: {detail}")]
    RefreshFailed { detail: String },

    #[error(transparent)]
    Internal(#[from] CastorError),
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match &self {
            ResolveError::InvalidInstanceId => (
                StatusCode::BAD_REQUEST,
                "invalid_instance_id",
                "Instance id must be a UUID.".to_string(),
            ),
            ResolveError::InstanceNotFound => (
                StatusCode::NOT_FOUND,
                "instance_not_found",
                "No such instance.".to_string(),
            ),
            ResolveError::ServiceDisabled(name) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_disabled",
                format!("Service {name} is currently disabled."),
            ),
            ResolveError::InstancePaused => (
                StatusCode::FORBIDDEN,
                "instance_paused",
                "This instance is not active.".to_string(),
            ),
            ResolveError::OauthRequired | ResolveError::NoCredential => (
                StatusCode::UNAUTHORIZED,
                "oauth_required",
                "Complete the OAuth authorization flow for this instance.".to_string(),
            ),
            ResolveError::ReauthRequired => (
                StatusCode::UNAUTHORIZED,
                "reauth_required",
                "Authorization has expired; re-run the OAuth flow.".to_string(),
            ),
            ResolveError::RefreshFailed { detail } => (
                StatusCode::UNAUTHORIZED,
                "refresh_failed",
                format!("Token refresh failed: {detail}"),
            ),
            ResolveError::Internal(inner) => return inner_response(inner),
        };

        (
            status,
            Json(ApiErrorBody {
                inner: ApiErrorObject {
                    code: code.to_string(),
                    message,
                    details: None,
                },
            }),
        )
            .into_response()
    }
}

fn inner_response(err: &CastorError) -> axum::response::Response {
    // Internal causes keep their own status mapping but must not leak detail.
    let status = match err {
        CastorError::UpstreamStatus(_) | CastorError::ReqwestError(_) | CastorError::Oauth(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiErrorBody {
            inner: ApiErrorObject {
                code: "INTERNAL_ERROR".to_string(),
                message: "An internal server error occurred.".to_string(),
                details: None,
            },
        }),
    )
        .into_response()
}
