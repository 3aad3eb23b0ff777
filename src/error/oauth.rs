use super::IsRetryable;
use super::castor::CastorError;
use axum::http::StatusCode;
use oauth2::basic::BasicErrorResponseType;
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{HttpClientError, RequestTokenError, StandardErrorResponse};
use serde_json::Value;
use thiserror::Error as ThisError;

/// Textual marker some providers use instead of the `invalid_grant` code.
const REVOKED_TOKEN_MARKER: &str = "Token has been expired or revoked";

#[derive(Debug, ThisError)]
pub enum OauthError {
    #[error("OAuth flow error: {message}")]
    Flow {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("OAuth2 request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("OAuth2 upstream error with status: {0}")]
    UpstreamStatus(StatusCode),

    #[error("OAuth2 server response error: {error}")]
    ServerResponse { error: String, description: String },

    #[error("OAuth2 token endpoint parse error: {message}. Body: {body}")]
    Parse { message: String, body: String },

    #[error("OAuth2 unexpected error: {message}")]
    Other { message: String },
}

impl OauthError {
    /// True for failures that mean the refresh token is dead and the user must
    /// re-run the authorization flow: `invalid_grant`, or the textual
    /// revocation marker some providers put in the error description.
    pub fn is_permanent(&self) -> bool {
        match self {
            OauthError::ServerResponse { error, description } => {
                error == "invalid_grant"
                    || description.contains(REVOKED_TOKEN_MARKER)
                    || error.contains(REVOKED_TOKEN_MARKER)
            }
            _ => false,
        }
    }
}

impl IsRetryable for OauthError {
    fn is_retryable(&self) -> bool {
        match self {
            OauthError::Request(_) => true,
            OauthError::UpstreamStatus(status) => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            OauthError::Parse { .. } => true,
            _ => false,
        }
    }
}

type PkgsRequestTokenError = RequestTokenError<
    HttpClientError<ReqwestClientError>,
    StandardErrorResponse<BasicErrorResponseType>,
>;

impl From<PkgsRequestTokenError> for OauthError {
    fn from(e: PkgsRequestTokenError) -> Self {
        match e {
            RequestTokenError::ServerResponse(err) => OauthError::ServerResponse {
                error: err.error().to_string(),
                description: err
                    .error_description()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            },
            RequestTokenError::Request(wrapper) => match wrapper {
                oauth2::HttpClientError::Reqwest(real_err) => OauthError::Request(*real_err),
                other => OauthError::Other {
                    message: format!("HttpClientError: {other:?}"),
                },
            },
            RequestTokenError::Parse(parse_err, body) => {
                let body_str = String::from_utf8_lossy(&body);
                let body = body_str
                    .char_indices()
                    .nth(100)
                    .map(|(idx, _)| format!("{}...<truncated>", &body_str[..idx]))
                    .unwrap_or_else(|| body_str.into_owned());
                OauthError::Parse {
                    message: parse_err.to_string(),
                    body,
                }
            }
            RequestTokenError::Other(s) => OauthError::Other { message: s },
        }
    }
}

impl From<PkgsRequestTokenError> for CastorError {
    fn from(e: PkgsRequestTokenError) -> Self {
        OauthError::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_permanent() {
        let err = OauthError::ServerResponse {
            error: "invalid_grant".to_string(),
            description: String::new(),
        };
        assert!(err.is_permanent());
        assert!(!err.is_retryable());
    }

    #[test]
    fn revoked_marker_in_description_is_permanent() {
        let err = OauthError::ServerResponse {
            error: "invalid_request".to_string(),
            description: "Token has been expired or revoked.".to_string(),
        };
        assert!(err.is_permanent());
    }

    #[test]
    fn transient_statuses_are_retryable() {
        assert!(OauthError::UpstreamStatus(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(OauthError::UpstreamStatus(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!OauthError::UpstreamStatus(StatusCode::FORBIDDEN).is_retryable());
    }
}
