use chrono::{DateTime, TimeZone, Utc};
use oauth2::{AuthorizationCode, CsrfToken, RedirectUrl, RefreshToken, Scope, TokenResponse};
use url::Url;

use super::client::{OauthTokenResponse, StandardOauth2Client, build_oauth2_client};
use super::state::StateBlob;
use crate::error::{CastorError, OauthError};
use crate::registry::ServiceSpec;

/// Fallback token lifetime when the provider reports no expiry.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Token material extracted from a provider token response.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl TokenBundle {
    pub(crate) fn from_response(resp: &OauthTokenResponse) -> Self {
        let expires_at = resp
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d)
            .or_else(|| {
                // Some providers report an absolute `expiry_date` in epoch millis.
                resp.extra_fields()
                    .extra
                    .get("expiry_date")
                    .and_then(serde_json::Value::as_i64)
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            })
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS));

        Self {
            access_token: resp.access_token().secret().clone(),
            refresh_token: resp.refresh_token().map(|t| t.secret().clone()),
            expires_at,
        }
    }
}

/// OAuth capability surface for one service: authorize URL construction,
/// code exchange, and refresh. One value per (service, credentials) pair,
/// built from the registry entry with optional per-instance client overrides.
pub struct ProviderOauth {
    service: String,
    client: StandardOauth2Client,
    scopes: Vec<Scope>,
}

impl ProviderOauth {
    /// Build from the registry spec. Instance rows may carry their own
    /// `client_id`/`client_secret`; those win over the catalog values.
    pub fn new(
        spec: &ServiceSpec,
        instance_client_id: Option<&str>,
        instance_client_secret: Option<&str>,
        redirect_url: Option<RedirectUrl>,
    ) -> Result<Self, CastorError> {
        let client_id = instance_client_id
            .filter(|s| !s.is_empty())
            .unwrap_or(spec.client_id.as_str());
        let client_secret = instance_client_secret
            .filter(|s| !s.is_empty())
            .or(Some(spec.client_secret.as_str()))
            .filter(|s| !s.is_empty());

        if client_id.is_empty() {
            return Err(OauthError::Flow {
                code: "MISSING_CLIENT".to_string(),
                message: format!("service {} has no OAuth client id configured", spec.name),
                details: None,
            }
            .into());
        }

        let client = build_oauth2_client(
            client_id,
            client_secret,
            &spec.auth_url,
            &spec.token_url,
            redirect_url,
        )?;

        Ok(Self {
            service: spec.name.clone(),
            client,
            scopes: spec.scopes.iter().cloned().map(Scope::new).collect(),
        })
    }

    /// Authorize URL with offline access, forced consent, the service's
    /// default scopes, and the encoded state blob.
    pub fn authorize_url(&self, state: &StateBlob) -> Result<Url, CastorError> {
        let encoded = state.encode()?;
        let mut req = self
            .client
            .authorize_url(move || CsrfToken::new(encoded))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent");

        for scope in &self.scopes {
            req = req.add_scope(scope.clone());
        }

        let (url, _csrf) = req.url();
        Ok(url)
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: String,
        http_client: &reqwest::Client,
    ) -> Result<TokenBundle, OauthError> {
        let resp: OauthTokenResponse = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(http_client)
            .await?;
        tracing::info!(service = %self.service, "OAuth2 code exchange completed successfully");
        Ok(TokenBundle::from_response(&resp))
    }

    /// Refresh the access token using the current refresh token.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        http_client: &reqwest::Client,
    ) -> Result<TokenBundle, OauthError> {
        let resp: OauthTokenResponse = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(http_client)
            .await?;
        Ok(TokenBundle::from_response(&resp))
    }
}
