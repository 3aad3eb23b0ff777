use axum::{Json, Router, routing::get};
use castor::config::{ServiceConfig, ServiceKind, ServicesConfig, SupervisorConfig};
use castor::db::{DbActorHandle, InstanceCreate, InstanceStatus, OauthStatus};
use castor::error::CastorError;
use castor::registry::ServiceRegistry;
use castor::supervisor::SupervisorHandle;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use uuid::Uuid;

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

fn broken_service_catalog() -> ServicesConfig {
    let mut services = ServicesConfig::new();
    services.insert(
        "github".to_string(),
        ServiceConfig {
            binary: "/nonexistent/castor-worker-github".to_string(),
            kind: ServiceKind::Oauth,
            ..Default::default()
        },
    );
    services
}

fn test_config(port_low: u16, port_high: u16) -> SupervisorConfig {
    SupervisorConfig {
        port_range_low: port_low,
        port_range_high: port_high,
        startup_timeout_seconds: 3,
        health_interval_seconds: 3600,
        reconcile_interval_seconds: 3600,
        terminate_grace_seconds: 1,
        shutdown_timeout_seconds: 5,
        probe_timeout_seconds: 2,
        max_start_retries: 1,
        log_root: std::env::temp_dir().join(format!("castor_logs_{}", Uuid::new_v4())),
    }
}

async fn spawn_supervisor(
    db: &DbActorHandle,
    services: &ServicesConfig,
    cfg: SupervisorConfig,
) -> SupervisorHandle {
    let registry = Arc::new(ServiceRegistry::from_config(services));
    castor::supervisor::spawn(db.clone(), registry, Arc::new(cfg)).await
}

async fn seed_instance(db: &DbActorHandle, service: &str) -> Uuid {
    let id = Uuid::new_v4();
    let mut create = InstanceCreate::oauth(id, Uuid::new_v4(), service);
    create.oauth_status = OauthStatus::Completed;
    create.access_token = Some("at-test".to_string());
    db.create_instance(create).await.unwrap();
    id
}

#[tokio::test]
async fn spawn_failure_retries_then_marks_failed_and_releases_port() {
    let (database_url, db_path) = temp_database_url("svfail");
    let db = castor::db::spawn(&database_url).await;
    let supervisor = spawn_supervisor(&db, &broken_service_catalog(), test_config(49240, 49241)).await;

    let id = seed_instance(&db, "github").await;

    let err = supervisor.start(id).await.unwrap_err();
    assert!(
        matches!(err, CastorError::SpawnFailed { .. }),
        "got {err:?}"
    );

    // Record is gone and the store row is failed with the reason recorded.
    assert!(supervisor.status(id).await.unwrap().is_none());
    let row = db.lookup_instance(id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Failed);
    assert!(row.last_error.is_some());
    assert!(row.pid.is_none());
    assert!(row.port.is_none());

    // Port was released: a second doomed start allocates again rather than
    // reporting exhaustion (range holds two ports; each start takes one).
    let id2 = seed_instance(&db, "github").await;
    let err = supervisor.start(id2).await.unwrap_err();
    assert!(matches!(err, CastorError::SpawnFailed { .. }));

    cleanup(&db_path).await;
}

#[tokio::test]
async fn ineligible_starts_fail_fast() {
    let (database_url, db_path) = temp_database_url("svelig");
    let db = castor::db::spawn(&database_url).await;
    let supervisor = spawn_supervisor(&db, &broken_service_catalog(), test_config(49244, 49247)).await;

    // Unknown instance
    let err = supervisor.start(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, CastorError::SpawnFailed { .. }));

    // Unknown service
    let ghost = Uuid::new_v4();
    let mut create = InstanceCreate::oauth(ghost, Uuid::new_v4(), "teleport");
    create.oauth_status = OauthStatus::Completed;
    db.create_instance(create).await.unwrap();
    let started = std::time::Instant::now();
    let err = supervisor.start(ghost).await.unwrap_err();
    assert!(matches!(err, CastorError::SpawnFailed { .. }));
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "fatal failures must not burn the retry budget"
    );

    // Free-plan quota: one extra active instance besides the target.
    let user = Uuid::new_v4();
    let mut first = InstanceCreate::oauth(Uuid::new_v4(), user, "github");
    first.oauth_status = OauthStatus::Completed;
    db.create_instance(first).await.unwrap();
    let second_id = Uuid::new_v4();
    let mut second = InstanceCreate::oauth(second_id, user, "slack");
    second.oauth_status = OauthStatus::Completed;
    db.create_instance(second).await.unwrap();

    let err = supervisor.start(second_id).await.unwrap_err();
    assert!(matches!(err, CastorError::SpawnFailed { .. }));
    let row = db.lookup_instance(second_id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Failed);
    assert!(row.last_error.unwrap().contains("quota"));

    cleanup(&db_path).await;
}

#[tokio::test]
async fn stop_is_idempotent_for_missing_workers() {
    let (database_url, db_path) = temp_database_url("svstop");
    let db = castor::db::spawn(&database_url).await;
    let supervisor = spawn_supervisor(&db, &broken_service_catalog(), test_config(49250, 49251)).await;

    let id = seed_instance(&db, "github").await;

    // Never started: stop succeeds and records the instance as inactive.
    supervisor.stop(id).await.unwrap();
    supervisor.stop(id).await.unwrap();

    // The store transition lands asynchronously.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let row = db.lookup_instance(id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Inactive);

    // Stopping an id with no row at all also succeeds.
    supervisor.stop(Uuid::new_v4()).await.unwrap();

    cleanup(&db_path).await;
}

#[tokio::test]
async fn port_exhaustion_surfaces_as_such() {
    let (database_url, db_path) = temp_database_url("svports");
    let db = castor::db::spawn(&database_url).await;

    // One-port range, and the port is held by this test.
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();
    let supervisor = spawn_supervisor(&db, &broken_service_catalog(), test_config(taken, taken)).await;

    let id = seed_instance(&db, "github").await;
    let err = supervisor.start(id).await.unwrap_err();
    assert!(matches!(err, CastorError::PortExhausted), "got {err:?}");

    drop(blocker);
    cleanup(&db_path).await;
}

/// Stand up an HTTP server that answers the worker contract, then check the
/// staged readiness probes against it.
#[tokio::test]
async fn readiness_probes_pass_against_a_conforming_worker() {
    let instance_id = Uuid::new_v4();
    let service = "github";

    let app = Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route(
            &format!("/{instance_id}/mcp/{service}/info"),
            get(|| async { Json(json!({ "name": "github-bridge", "version": "1.0" })) }),
        )
        .route(
            &format!("/{instance_id}/mcp/{service}/tools"),
            get(|| async { Json(json!({ "tools": [{ "name": "search_issues" }] })) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    castor::supervisor::probe::wait_until_ready(
        &client,
        port,
        instance_id,
        service,
        Duration::from_secs(10),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    castor::supervisor::probe::health_pass(
        &client,
        port,
        instance_id,
        service,
        Duration::from_secs(2),
    )
    .await
    .unwrap();
}

/// A worker with an empty tool list never reaches ready.
#[tokio::test]
async fn empty_tool_list_fails_the_protocol_probe() {
    let instance_id = Uuid::new_v4();
    let service = "notion";

    let app = Router::new()
        .route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
        .route(
            &format!("/{instance_id}/mcp/{service}/info"),
            get(|| async { Json(json!({ "name": "notion-bridge" })) }),
        )
        .route(
            &format!("/{instance_id}/mcp/{service}/tools"),
            get(|| async { Json(json!({ "tools": [] })) }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let err = castor::supervisor::probe::wait_until_ready(
        &client,
        port,
        instance_id,
        service,
        Duration::from_secs(3),
        Duration::from_secs(1),
    )
    .await
    .unwrap_err();
    assert!(
        matches!(err, CastorError::ProtocolProbeFailed(_)),
        "got {err:?}"
    );
}
