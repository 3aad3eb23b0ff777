use crate::config::Config;
use crate::credentials::TokenResolver;
use crate::db::DbActorHandle;
use crate::registry::ServiceRegistry;
use crate::server::guards::auth::RequireAdminKey;
use crate::server::routes::{instances, mcp, oauth, webhooks};
use crate::supervisor::SupervisorHandle;
use crate::webhooks::WebhookProcessor;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderName, StatusCode, Version, header::USER_AGENT},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use base64::Engine as _;
use rand::RngCore;
use serde_json::json;
use std::time::{Duration, Instant};
use std::sync::Arc;
use tracing::{error, info, warn};

const MAX_REQUEST_ID_LEN: usize = 128;
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

fn generate_request_id() -> String {
    // 96 bits => 16 chars base64url (no padding).
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn format_http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2",
        Version::HTTP_3 => "HTTP/3",
        _ => "HTTP/?",
    }
}

#[derive(Clone)]
pub struct CastorState {
    pub db: DbActorHandle,
    pub registry: Arc<ServiceRegistry>,
    pub resolver: Arc<TokenResolver>,
    pub supervisor: SupervisorHandle,
    pub webhooks: Arc<WebhookProcessor>,
    /// Client for forwarding tool calls to workers on localhost.
    pub forward_client: reqwest::Client,
    /// Client for OAuth code exchange against providers.
    pub oauth_client: reqwest::Client,
    pub castor_key: Arc<str>,
    pub public_domain: Arc<str>,
}

impl CastorState {
    pub fn new(
        cfg: &Config,
        db: DbActorHandle,
        registry: Arc<ServiceRegistry>,
        supervisor: SupervisorHandle,
    ) -> Self {
        let forward_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build worker forwarding client");
        let oauth_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .expect("failed to build OAuth client");

        let resolver = Arc::new(TokenResolver::new(
            db.clone(),
            registry.clone(),
            oauth_client.clone(),
        ));
        let webhooks = Arc::new(WebhookProcessor::new(db.clone(), &cfg.webhooks));

        Self {
            db,
            registry,
            resolver,
            supervisor,
            webhooks,
            forward_client,
            oauth_client,
            castor_key: Arc::from(cfg.basic.castor_key.as_str()),
            public_domain: Arc::from(cfg.basic.public_domain.trim_end_matches('/')),
        }
    }
}

async fn health_handler(State(state): State<CastorState>) -> Json<serde_json::Value> {
    let workers = state
        .supervisor
        .list_workers()
        .await
        .map(|w| w.len())
        .unwrap_or(0);
    Json(json!({
        "status": "ok",
        "services": state.registry.len(),
        "workers": workers,
    }))
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn access_log(req: Request, next: Next) -> Response {
    // Capture request metadata before moving `req` into the handler stack.
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let start = Instant::now();
    let mut resp = next.run(req).await;

    // Always reflect `x-request-id` for easier correlation, even if the client didn't send one.
    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(X_REQUEST_ID, value);
    }

    let status = resp.status();
    let latency_ms = start.elapsed().as_millis() as u64;
    let path = uri.path();
    let protocol = format_http_version(version);

    if status.is_server_error() {
        error!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    } else if status.is_client_error() {
        warn!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    } else {
        info!(
            "| {:>3} | {} | {:^7} | {:<8} | {} | {}ms | {}",
            status.as_u16(),
            request_id,
            method.as_str(),
            protocol,
            path,
            latency_ms,
            user_agent
        );
    }

    resp
}

pub fn castor_router(state: CastorState) -> Router {
    let admin = instances::router().layer(middleware::from_extractor_with_state::<
        RequireAdminKey,
        _,
    >(state.clone()));

    Router::new()
        .route("/health", get(health_handler))
        .merge(oauth::router())
        .merge(webhooks::router())
        .merge(mcp::router())
        .merge(admin)
        .fallback(not_found_handler)
        .with_state(state)
        .layer(middleware::from_fn(access_log))
}
