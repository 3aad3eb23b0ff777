use castor::db::{
    InstanceCreate, InstanceStatus, OauthPatch, OauthStatus, RuntimePatch,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;
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

#[tokio::test]
async fn instance_lifecycle_baseline() {
    let (database_url, db_path) = temp_database_url("instances");
    let db = castor::db::spawn(&database_url).await;

    // 1. Fresh DB has no active instances
    let active = db.list_active_instances().await.unwrap();
    assert!(active.is_empty(), "expected no active instances initially");

    // 2. Create an OAuth instance and look it up
    let instance_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    db.create_instance(InstanceCreate::oauth(instance_id, user_id, "github"))
        .await
        .unwrap();

    let row = db.lookup_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(row.id, instance_id);
    assert_eq!(row.user_id, user_id);
    assert_eq!(row.service_name, "github");
    assert_eq!(row.status, InstanceStatus::Active);
    assert_eq!(row.oauth_status, OauthStatus::Pending);
    assert!(row.access_token.is_none());

    // 3. Unknown ids resolve to None
    assert!(db.lookup_instance(Uuid::new_v4()).await.unwrap().is_none());

    // 4. OAuth patch applies token material
    let expiry = chrono::Utc::now() + chrono::Duration::hours(2);
    db.patch_oauth(
        instance_id,
        OauthPatch {
            oauth_status: Some(OauthStatus::Completed),
            access_token: Some("at-1".to_string()),
            refresh_token: Some("rt-1".to_string()),
            token_expires_at: Some(expiry),
        },
    )
    .await
    .unwrap();
    let row = db.lookup_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(row.oauth_status, OauthStatus::Completed);
    assert_eq!(row.access_token.as_deref(), Some("at-1"));
    assert_eq!(row.refresh_token.as_deref(), Some("rt-1"));
    assert_eq!(row.token_expires_at, Some(expiry));

    // 5. Usage touch moves last_accessed_at forward
    let before = row.last_accessed_at;
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    db.touch_instance_usage(instance_id).await.unwrap();
    let row = db.lookup_instance(instance_id).await.unwrap().unwrap();
    assert!(row.last_accessed_at > before);

    // 6. Runtime patch sets pid/port, clear_runtime wipes them
    db.patch_runtime(
        instance_id,
        RuntimePatch {
            pid: Some(4242),
            port: Some(49321),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let row = db.lookup_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(row.pid, Some(4242));
    assert_eq!(row.port, Some(49321));

    db.patch_runtime(
        instance_id,
        RuntimePatch {
            status: Some(InstanceStatus::Failed),
            last_error: Some("orphaned".to_string()),
            clear_runtime: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let row = db.lookup_instance(instance_id).await.unwrap().unwrap();
    assert_eq!(row.status, InstanceStatus::Failed);
    assert_eq!(row.last_error.as_deref(), Some("orphaned"));
    assert!(row.pid.is_none());
    assert!(row.port.is_none());

    // 7. Failed rows are not listed as active
    let active = db.list_active_instances().await.unwrap();
    assert!(active.is_empty());

    cleanup(&db_path).await;
}

#[tokio::test]
async fn stuck_provisioning_scan_honors_cutoff() {
    let (database_url, db_path) = temp_database_url("stuck");
    let db = castor::db::spawn(&database_url).await;

    let fresh = Uuid::new_v4();
    let user = Uuid::new_v4();
    let mut create = InstanceCreate::oauth(fresh, user, "notion");
    create.status = InstanceStatus::Provisioning;
    db.create_instance(create).await.unwrap();

    // A row created just now is not stuck for a cutoff in the past.
    let cutoff = chrono::Utc::now() - chrono::Duration::minutes(2);
    let stuck = db.list_stuck_provisioning(cutoff).await.unwrap();
    assert!(stuck.is_empty());

    // With a future cutoff the same row qualifies.
    let cutoff = chrono::Utc::now() + chrono::Duration::minutes(1);
    let stuck = db.list_stuck_provisioning(cutoff).await.unwrap();
    assert_eq!(stuck, vec![fresh]);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn active_pair_uniqueness_is_enforced() {
    let (database_url, db_path) = temp_database_url("unique");
    let db = castor::db::spawn(&database_url).await;

    let user = Uuid::new_v4();
    db.create_instance(InstanceCreate::oauth(Uuid::new_v4(), user, "slack"))
        .await
        .unwrap();

    // Second active bridge for the same (user, service) violates the
    // partial unique index.
    let dup = db
        .create_instance(InstanceCreate::oauth(Uuid::new_v4(), user, "slack"))
        .await;
    assert!(dup.is_err(), "expected duplicate active pair to be rejected");

    // A different service is fine.
    db.create_instance(InstanceCreate::oauth(Uuid::new_v4(), user, "dropbox"))
        .await
        .unwrap();

    let count = db.count_active_instances(user).await.unwrap();
    assert_eq!(count, 2);

    cleanup(&db_path).await;
}
