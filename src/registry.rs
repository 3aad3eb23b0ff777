//! Service catalog indexed at startup; worker dispatch is a table lookup.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ServiceKind, ServicesConfig, resolve_service_env};

/// Resolved catalog entry for one bridgeable service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    /// Worker binary launched for this service.
    pub binary: String,
    pub args: Vec<String>,
    pub kind: ServiceKind,
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub enabled: bool,
    pub metadata: Value,
}

impl ServiceSpec {
    pub fn is_oauth(&self) -> bool {
        self.kind == ServiceKind::Oauth
    }
}

/// Immutable `service_name -> ServiceSpec` table built once at boot.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<ServiceSpec>>,
}

impl ServiceRegistry {
    /// Build the registry from config, applying `OAUTH_<NAME>_*` env overrides.
    pub fn from_config(services: &ServicesConfig) -> Self {
        let services = services
            .iter()
            .map(|(name, cfg)| {
                let resolved = resolve_service_env(name, cfg);
                let spec = ServiceSpec {
                    name: name.clone(),
                    binary: resolved.binary,
                    args: resolved.args,
                    kind: resolved.kind,
                    scopes: resolved.scopes,
                    auth_url: resolved.auth_url,
                    token_url: resolved.token_url,
                    client_id: resolved.client_id,
                    client_secret: resolved.client_secret,
                    enabled: resolved.enabled,
                    metadata: resolved.metadata,
                };
                (name.clone(), Arc::new(spec))
            })
            .collect();
        Self { services }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceSpec>> {
        self.services.get(name).cloned()
    }

    /// Enabled check folded in; `None` means unknown or disabled. Callers
    /// that need to distinguish use [`ServiceRegistry::get`].
    pub fn get_enabled(&self, name: &str) -> Option<Arc<ServiceSpec>> {
        self.services.get(name).filter(|s| s.enabled).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn catalog() -> ServicesConfig {
        let mut services = ServicesConfig::new();
        services.insert(
            "github".to_string(),
            ServiceConfig {
                binary: "/opt/castor/workers/mcp-github".to_string(),
                kind: ServiceKind::Oauth,
                auth_url: "https://github.com/login/oauth/authorize".to_string(),
                token_url: "https://github.com/login/oauth/access_token".to_string(),
                ..Default::default()
            },
        );
        services.insert(
            "figma".to_string(),
            ServiceConfig {
                binary: "/opt/castor/workers/mcp-figma".to_string(),
                kind: ServiceKind::ApiKey,
                enabled: false,
                ..Default::default()
            },
        );
        services
    }

    #[test]
    fn lookup_and_enabled_filter() {
        let registry = ServiceRegistry::from_config(&catalog());
        assert_eq!(registry.len(), 2);
        assert!(registry.get("github").is_some());
        assert!(registry.get_enabled("github").is_some());
        assert!(registry.get("figma").is_some());
        assert!(registry.get_enabled("figma").is_none());
        assert!(registry.get("dropbox").is_none());
    }
}
