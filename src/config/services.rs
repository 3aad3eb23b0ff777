use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Credential shape of a service: static API key or three-legged OAuth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    ApiKey,
    Oauth,
}

impl Default for ServiceKind {
    fn default() -> Self {
        Self::Oauth
    }
}

/// Per-service entry in config.toml (`services.<name>` table).
///
/// `client_id`/`client_secret` may be left empty and provided through
/// `OAUTH_<NAME>_CLIENT_ID` / `OAUTH_<NAME>_CLIENT_SECRET` instead; the env
/// value wins when both are present.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Worker binary launched for this service.
    #[serde(default)]
    pub binary: String,

    /// Extra argv passed to the worker binary.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_kind")]
    pub kind: ServiceKind,

    /// OAuth scopes requested on the authorize URL.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Provider authorize endpoint (OAuth services only).
    #[serde(default)]
    pub auth_url: String,

    /// Provider token endpoint (OAuth services only).
    #[serde(default)]
    pub token_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    /// Disabled services reject resolution with `ServiceDisabled`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Free-form catalog metadata (display name, canonical port, docs URL).
    /// Kept here so ops scripts never become the source of truth for it.
    #[serde(default)]
    pub metadata: Value,
}

fn default_kind() -> ServiceKind {
    ServiceKind::Oauth
}

fn default_enabled() -> bool {
    true
}

/// Per-gateway entry in config.toml (`webhooks.<gateway>` table).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// HMAC shared secret; `WEBHOOK_<GATEWAY>_SECRET` overrides.
    #[serde(default)]
    pub secret: String,
}

/// Apply the `OAUTH_<NAME>_*` environment overrides for one service.
pub fn resolve_service_env(name: &str, cfg: &ServiceConfig) -> ServiceConfig {
    let upper = env_segment(name);
    let mut resolved = cfg.clone();
    if let Ok(id) = std::env::var(format!("OAUTH_{upper}_CLIENT_ID")) {
        resolved.client_id = id;
    }
    if let Ok(secret) = std::env::var(format!("OAUTH_{upper}_CLIENT_SECRET")) {
        resolved.client_secret = secret;
    }
    resolved
}

/// Apply the `WEBHOOK_<GATEWAY>_SECRET` environment override for one gateway.
pub fn resolve_gateway_env(name: &str, cfg: &GatewayConfig) -> GatewayConfig {
    let mut resolved = cfg.clone();
    if let Ok(secret) = std::env::var(format!("WEBHOOK_{}_SECRET", env_segment(name))) {
        resolved.secret = secret;
    }
    resolved
}

fn env_segment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Map of `services.<name>` tables keyed by service name.
pub type ServicesConfig = BTreeMap<String, ServiceConfig>;

/// Map of `webhooks.<gateway>` tables keyed by gateway name.
pub type WebhooksConfig = BTreeMap<String, GatewayConfig>;
