use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use castor::config::{Config, GatewayConfig, ServiceConfig, ServiceKind};
use castor::db::{DbActorHandle, InstanceCreate, OauthStatus};
use castor::registry::ServiceRegistry;
use castor::server::router::{CastorState, castor_router};
use castor::webhooks::sign;
use serde_json::{Value, json};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs;
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN_KEY: &str = "castor-admin-key";
const GATEWAY: &str = "razorpay";
const SECRET: &str = "whsec_route_tests";

fn temp_database_url(tag: &str) -> (String, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    tag.hash(&mut hasher);
    let db_path = tmp_dir.join(format!("castor_{tag}_{}.sqlite", hasher.finish()));
    (
        format!("sqlite:{}", db_path.to_str().unwrap()),
        db_path,
    )
}

async fn cleanup(db_path: &std::path::Path) {
    let wal = std::path::PathBuf::from(format!("{}-wal", db_path.to_string_lossy()));
    let shm = std::path::PathBuf::from(format!("{}-shm", db_path.to_string_lossy()));
    let _ = fs::remove_file(&wal).await;
    let _ = fs::remove_file(&shm).await;
    let _ = fs::remove_file(db_path).await;
}

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.basic.castor_key = ADMIN_KEY.to_string();
    cfg.supervisor.port_range_low = 49280;
    cfg.supervisor.port_range_high = 49290;
    cfg.supervisor.health_interval_seconds = 3600;
    cfg.supervisor.reconcile_interval_seconds = 3600;
    cfg.services.insert(
        "github".to_string(),
        ServiceConfig {
            binary: "/nonexistent/castor-worker-github".to_string(),
            kind: ServiceKind::Oauth,
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            client_id: "cid".to_string(),
            client_secret: "sec".to_string(),
            ..Default::default()
        },
    );
    cfg.webhooks.insert(
        GATEWAY.to_string(),
        GatewayConfig {
            secret: SECRET.to_string(),
        },
    );
    cfg
}

async fn build_app(db: &DbActorHandle, cfg: &Config) -> axum::Router {
    let registry = Arc::new(ServiceRegistry::from_config(&cfg.services));
    let supervisor = castor::supervisor::spawn(
        db.clone(),
        registry.clone(),
        Arc::new(cfg.supervisor.clone()),
    )
    .await;
    let state = CastorState::new(cfg, db.clone(), registry, supervisor);
    castor_router(state)
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (database_url, db_path) = temp_database_url("rt_health");
    let db = castor::db::spawn(&database_url).await;
    let app = build_app(&db, &test_config()).await;

    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["services"], 1);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn admin_routes_require_the_shared_key() {
    let (database_url, db_path) = temp_database_url("rt_admin");
    let db = castor::db::spawn(&database_url).await;
    let app = build_app(&db, &test_config()).await;

    let instance_id = Uuid::new_v4();
    db.create_instance(InstanceCreate::oauth(instance_id, Uuid::new_v4(), "github"))
        .await
        .unwrap();

    // No key
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/api/instances/{instance_id}/status"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Wrong key
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/api/instances/{instance_id}/status"))
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Right key
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/api/instances/{instance_id}/status"))
                .header("x-api-key", ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["service"], "github");
    assert_eq!(body["worker"], Value::Null);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn auth_gate_maps_resolution_failures() {
    let (database_url, db_path) = temp_database_url("rt_gate");
    let db = castor::db::spawn(&database_url).await;
    let app = build_app(&db, &test_config()).await;

    // Not a UUID
    let resp = app
        .clone()
        .oneshot(
            Request::get("/not-a-uuid/mcp/github/tools")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "invalid_instance_id");

    // Unknown instance
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/{}/mcp/github/tools", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Pending OAuth
    let pending = Uuid::new_v4();
    db.create_instance(InstanceCreate::oauth(pending, Uuid::new_v4(), "github"))
        .await
        .unwrap();
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/{pending}/mcp/github/tools"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "oauth_required");

    cleanup(&db_path).await;
}

#[tokio::test]
async fn webhook_route_verifies_and_acknowledges() {
    let (database_url, db_path) = temp_database_url("rt_hook");
    let db = castor::db::spawn(&database_url).await;
    let app = build_app(&db, &test_config()).await;

    let user = Uuid::new_v4();
    let body = json!({
        "id": "evt_route",
        "type": "subscription.activated",
        "data": {
            "subscription": {
                "entity": {
                    "id": "sub_route",
                    "notes": { "user_id": user.to_string() }
                }
            }
        }
    })
    .to_string();

    // Bad signature
    let resp = app
        .clone()
        .oneshot(
            Request::post(format!("/billing/webhooks/{GATEWAY}"))
                .header("x-signature", "deadbeef")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let parsed = body_json(resp).await;
    assert_eq!(parsed["error"]["code"], "invalid_signature");

    // Good signature
    let sig = sign(SECRET, body.as_bytes());
    let resp = app
        .clone()
        .oneshot(
            Request::post(format!("/billing/webhooks/{GATEWAY}"))
                .header("x-signature", sig)
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let parsed = body_json(resp).await;
    assert_eq!(parsed["status"], "processed");

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, castor::db::PlanType::Pro);

    // Malformed JSON with a valid signature is a 400, not a 500.
    let junk = "{not json";
    let sig = sign(SECRET, junk.as_bytes());
    let resp = app
        .clone()
        .oneshot(
            Request::post(format!("/billing/webhooks/{GATEWAY}"))
                .header("x-signature", sig)
                .body(Body::from(junk))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn oauth_authorize_redirects_with_state() {
    let (database_url, db_path) = temp_database_url("rt_oauth");
    let db = castor::db::spawn(&database_url).await;
    let app = build_app(&db, &test_config()).await;

    let instance_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    db.create_instance(InstanceCreate::oauth(instance_id, user_id, "github"))
        .await
        .unwrap();

    let resp = app
        .clone()
        .oneshot(
            Request::get(format!(
                "/oauth/github/authorize?instance_id={instance_id}&user_id={user_id}"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);

    let location = resp
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(location.starts_with("https://github.com/login/oauth/authorize"));
    assert!(location.contains("access_type=offline"));
    assert!(location.contains("prompt=consent"));
    assert!(location.contains("state="));

    // The flow is now marked pending.
    let row = db.lookup_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(row.oauth_status, OauthStatus::Pending);

    // Mismatched owner is rejected.
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!(
                "/oauth/github/authorize?instance_id={instance_id}&user_id={}",
                Uuid::new_v4()
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    cleanup(&db_path).await;
}
