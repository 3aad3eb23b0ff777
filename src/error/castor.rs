use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

use super::IsRetryable;
use super::oauth::OauthError;

#[derive(Debug, ThisError)]
pub enum CastorError {
    #[error("Upstream error with status: {0}")]
    UpstreamStatus(StatusCode),

    #[error(transparent)]
    Oauth(#[from] OauthError),

    #[error("HTTP request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Ractor error: {0}")]
    RactorError(String),

    #[error("No free worker port in the configured range")]
    PortExhausted,

    #[error("Worker spawn failed: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker did not become ready within the startup budget")]
    StartupTimeout,

    #[error("Worker protocol probe failed: {0}")]
    ProtocolProbeFailed(String),

    #[error("Worker for instance is not running")]
    WorkerNotRunning,

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Unexpected error: {0}")]
    UnexpectedError(String),
}

impl IntoResponse for CastorError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_body) = match self {
            CastorError::DatabaseError(_)
            | CastorError::RactorError(_)
            | CastorError::UnexpectedError(_)
            | CastorError::Oauth(OauthError::Other { .. })
            | CastorError::IoError(_) => {
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = ApiErrorObject {
                    code: "INTERNAL_ERROR".to_string(),
                    message: "An internal server error occurred.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::SpawnFailed { .. }
            | CastorError::StartupTimeout
            | CastorError::ProtocolProbeFailed(_) => {
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = ApiErrorObject {
                    code: "WORKER_START_FAILED".to_string(),
                    message: "The worker process could not be started.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::PortExhausted | CastorError::WorkerNotRunning => {
                let status = StatusCode::SERVICE_UNAVAILABLE;
                let body = ApiErrorObject {
                    code: "WORKER_UNAVAILABLE".to_string(),
                    message: "No worker capacity is available for this instance.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::SignatureInvalid => {
                let status = StatusCode::BAD_REQUEST;
                let body = ApiErrorObject {
                    code: "invalid_signature".to_string(),
                    message: "Webhook signature verification failed.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::Oauth(OauthError::Flow {
                code,
                message,
                details,
            }) => {
                let status = StatusCode::FORBIDDEN;
                let body = ApiErrorObject {
                    code,
                    message,
                    details,
                };
                (status, body)
            }

            CastorError::JsonError(_) | CastorError::Oauth(OauthError::Parse { .. }) => {
                let status = StatusCode::BAD_GATEWAY;
                let body = ApiErrorObject {
                    code: "BAD_UPSTREAM_PAYLOAD".to_string(),
                    message: "Failed to parse upstream response.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::Oauth(OauthError::Request(_))
            | CastorError::Oauth(OauthError::ServerResponse { .. })
            | CastorError::ReqwestError(_)
            | CastorError::UrlError(_) => {
                let status = StatusCode::BAD_GATEWAY;
                let body = ApiErrorObject {
                    code: "UPSTREAM_ERROR".to_string(),
                    message: "Upstream service error.".to_string(),
                    details: None,
                };
                (status, body)
            }

            CastorError::UpstreamStatus(code)
            | CastorError::Oauth(OauthError::UpstreamStatus(code)) => {
                let (err_code, msg) = match code {
                    StatusCode::TOO_MANY_REQUESTS => {
                        ("RATE_LIMIT", "Upstream rate limit exceeded.")
                    }
                    StatusCode::UNAUTHORIZED => ("UNAUTHORIZED", "Upstream authentication failed."),
                    StatusCode::FORBIDDEN => ("FORBIDDEN", "Upstream permission denied."),
                    StatusCode::NOT_FOUND => ("NOT_FOUND", "Upstream resource not found."),
                    StatusCode::GATEWAY_TIMEOUT => ("UPSTREAM_TIMEOUT", "Upstream timed out."),
                    _ => ("UPSTREAM_ERROR", "An upstream error occurred."),
                };
                (
                    code,
                    ApiErrorObject {
                        code: err_code.to_string(),
                        message: msg.to_string(),
                        details: None,
                    },
                )
            }
        };
        (status, Json(ApiErrorBody { inner: error_body })).into_response()
    }
}

/// Standardized API error response payload.
#[derive(Serialize)]
pub struct ApiErrorObject {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Serialize)]
pub struct ApiErrorBody {
    #[serde(rename = "error")]
    pub inner: ApiErrorObject,
}

impl IsRetryable for CastorError {
    fn is_retryable(&self) -> bool {
        match self {
            CastorError::ReqwestError(_) => true,
            CastorError::DatabaseError(e) => {
                matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
            }
            CastorError::UpstreamStatus(status) => matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            CastorError::Oauth(e) => e.is_retryable(),
            CastorError::SpawnFailed { .. }
            | CastorError::StartupTimeout
            | CastorError::ProtocolProbeFailed(_) => true,
            _ => false,
        }
    }
}
