use castor::db::{
    ActivationOutcome, BillingPatch, InstanceCreate, InstanceStatus, PaymentStatus, PlanType,
    ProActivation,
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
async fn pro_activation_is_idempotent() {
    let (database_url, db_path) = temp_database_url("activation");
    let db = castor::db::spawn(&database_url).await;

    let user = Uuid::new_v4();
    let expires = chrono::Utc::now() + chrono::Duration::days(30);
    let activation = ProActivation {
        user_id: user,
        subscription_id: "sub_777".to_string(),
        expires_at: Some(expires),
        customer_id: Some("cust_1".to_string()),
    };

    // First application activates
    let outcome = db.activate_pro(activation.clone()).await.unwrap();
    assert_eq!(outcome, ActivationOutcome::Activated);

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, PlanType::Pro);
    assert_eq!(plan.payment_status, PaymentStatus::Active);
    assert_eq!(plan.subscription_id.as_deref(), Some("sub_777"));
    assert_eq!(plan.customer_id.as_deref(), Some("cust_1"));
    assert_eq!(plan.plan_type.max_instances(), 5);

    // Second application with the same arguments reports already_active
    let outcome = db.activate_pro(activation).await.unwrap();
    assert_eq!(outcome, ActivationOutcome::AlreadyActive);

    // Lookup by subscription id resolves the same plan
    let by_sub = db
        .get_user_plan_by_subscription("sub_777")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_sub.user_id, user);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn billing_patch_updates_payment_state() {
    let (database_url, db_path) = temp_database_url("billing");
    let db = castor::db::spawn(&database_url).await;

    let user = Uuid::new_v4();
    db.activate_pro(ProActivation {
        user_id: user,
        subscription_id: "sub_9".to_string(),
        expires_at: None,
        customer_id: None,
    })
    .await
    .unwrap();

    db.patch_billing(
        user,
        BillingPatch {
            payment_status: Some(PaymentStatus::Failed),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.payment_status, PaymentStatus::Failed);
    // Plan itself is untouched by a billing-only patch
    assert_eq!(plan.plan_type, PlanType::Pro);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn cancellation_downgrades_and_deactivates_oldest_first() {
    let (database_url, db_path) = temp_database_url("cancel");
    let db = castor::db::spawn(&database_url).await;

    let user = Uuid::new_v4();
    db.activate_pro(ProActivation {
        user_id: user,
        subscription_id: "sub_cancel".to_string(),
        expires_at: None,
        customer_id: None,
    })
    .await
    .unwrap();

    // Four active instances, created oldest-to-newest. Touch each in order so
    // last_accessed_at strictly increases.
    let services = ["github", "notion", "dropbox", "slack"];
    let mut ids = Vec::new();
    for service in services {
        let id = Uuid::new_v4();
        db.create_instance(InstanceCreate::oauth(id, user, service))
            .await
            .unwrap();
        db.touch_instance_usage(id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        ids.push(id);
    }

    let deactivated = db.handle_plan_cancellation(user).await.unwrap();

    // Free quota is 1: the three oldest instances are deactivated.
    assert_eq!(deactivated.len(), 3);
    assert_eq!(deactivated, ids[..3].to_vec());

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, PlanType::Free);
    assert_eq!(plan.payment_status, PaymentStatus::Cancelled);
    assert!(plan.subscription_id.is_none());

    // The newest instance survives.
    let survivor = db.lookup_instance(ids[3]).await.unwrap().unwrap();
    assert_eq!(survivor.status, InstanceStatus::Active);
    for id in &ids[..3] {
        let row = db.lookup_instance(*id).await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Inactive);
    }

    assert_eq!(db.count_active_instances(user).await.unwrap(), 1);

    cleanup(&db_path).await;
}
