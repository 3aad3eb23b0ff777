mod basic;
mod services;
mod supervisor;

pub use basic::BasicConfig;
pub use services::{
    GatewayConfig, ServiceConfig, ServiceKind, ServicesConfig, WebhooksConfig, resolve_gateway_env,
    resolve_service_env,
};
pub use supervisor::SupervisorConfig;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, str::FromStr, sync::LazyLock};
use tracing::warn;

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Worker supervision knobs (see `supervisor` table in config.toml).
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Service catalog (`services.<name>` tables).
    #[serde(default)]
    pub services: ServicesConfig,

    /// Billing webhook gateways (`webhooks.<gateway>` tables).
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults, `config.toml` if present, and
    /// the documented environment overrides (env wins over TOML).
    ///
    /// Note: this does **not** validate required fields like `basic.castor_key`.
    /// Binaries should call [`Config::from_toml`] instead to avoid running with
    /// insecure defaults.
    pub fn from_optional_toml() -> Self {
        let mut cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        });
        cfg.apply_env_overrides();
        cfg
    }

    /// Loads configuration and validates required fields.
    pub fn from_toml() -> Self {
        let mut cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration from {DEFAULT_CONFIG_FILE}: {err}")
        });
        cfg.apply_env_overrides();
        if cfg.basic.castor_key.trim().is_empty() {
            panic!("basic.castor_key must be set and non-empty (or CASTOR_KEY in the environment)");
        }
        if cfg.supervisor.port_range_low > cfg.supervisor.port_range_high {
            panic!("supervisor.port_range_low must not exceed supervisor.port_range_high");
        }
        cfg
    }

    /// The documented environment variables override their TOML counterparts.
    /// Service (`OAUTH_<NAME>_*`) and gateway (`WEBHOOK_<GATEWAY>_SECRET`)
    /// overrides are applied at registry/processor build time instead, since
    /// their key set depends on the configured names.
    fn apply_env_overrides(&mut self) {
        override_parsed("LISTEN_ADDR", &mut self.basic.listen_addr);
        override_parsed("LISTEN_PORT", &mut self.basic.listen_port);
        override_string("DATABASE_URL", &mut self.basic.database_url);
        override_string("LOGLEVEL", &mut self.basic.loglevel);
        override_string("CASTOR_KEY", &mut self.basic.castor_key);
        override_string("PUBLIC_DOMAIN", &mut self.basic.public_domain);

        override_parsed("PORT_RANGE_LOW", &mut self.supervisor.port_range_low);
        override_parsed("PORT_RANGE_HIGH", &mut self.supervisor.port_range_high);
        override_parsed(
            "STARTUP_TIMEOUT_SECONDS",
            &mut self.supervisor.startup_timeout_seconds,
        );
        override_parsed(
            "HEALTH_INTERVAL_SECONDS",
            &mut self.supervisor.health_interval_seconds,
        );
        override_parsed(
            "RECONCILE_INTERVAL_SECONDS",
            &mut self.supervisor.reconcile_interval_seconds,
        );
    }
}

fn override_string(key: &str, slot: &mut String) {
    if let Ok(value) = std::env::var(key) {
        *slot = value;
    }
}

fn override_parsed<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!("ignoring unparseable {key}={raw}"),
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_optional_toml);
