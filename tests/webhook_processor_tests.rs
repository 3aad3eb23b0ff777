use castor::config::{GatewayConfig, WebhooksConfig};
use castor::db::{PaymentStatus, PlanType, ProActivation, ProcessingStatus};
use castor::error::CastorError;
use castor::webhooks::{WebhookOutcome, WebhookProcessor, sign};
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;
use tokio::fs;
use uuid::Uuid;

const GATEWAY: &str = "razorpay";
const SECRET: &str = "whsec_test_castor";

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

fn gateway_config() -> WebhooksConfig {
    let mut webhooks = WebhooksConfig::new();
    webhooks.insert(
        GATEWAY.to_string(),
        GatewayConfig {
            secret: SECRET.to_string(),
        },
    );
    webhooks
}

fn activated_event(event_id: &str, user: Uuid, subscription: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "subscription.activated",
        "data": {
            "subscription": {
                "entity": {
                    "id": subscription,
                    "status": "active",
                    "current_end": (chrono::Utc::now() + chrono::Duration::days(30)).timestamp(),
                    "customer_id": "cust_42",
                    "notes": { "user_id": user.to_string() }
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn invalid_signature_rejects_without_side_effects() {
    let (database_url, db_path) = temp_database_url("whsig");
    let db = castor::db::spawn(&database_url).await;
    let processor = WebhookProcessor::new(db.clone(), &gateway_config());

    let body = activated_event("evt_sig", Uuid::new_v4(), "sub_sig");
    let mut sig_bytes = hex::decode(sign(SECRET, &body)).unwrap();
    sig_bytes[3] ^= 0x40;
    let tampered = hex::encode(sig_bytes);

    let err = processor.process(GATEWAY, &body, &tampered).await;
    assert!(matches!(err, Err(CastorError::SignatureInvalid)));

    // Nothing was recorded.
    assert!(db.get_webhook_event("evt_sig").await.unwrap().is_none());

    // Unconfigured gateways reject the same way.
    let good_sig = sign(SECRET, &body);
    let err = processor.process("stripe", &body, &good_sig).await;
    assert!(matches!(err, Err(CastorError::SignatureInvalid)));

    cleanup(&db_path).await;
}

#[tokio::test]
async fn duplicate_event_is_skipped_and_activation_applies_once() {
    let (database_url, db_path) = temp_database_url("whdup");
    let db = castor::db::spawn(&database_url).await;
    let processor = WebhookProcessor::new(db.clone(), &gateway_config());

    let user = Uuid::new_v4();
    let body = activated_event("evt_1", user, "sub_1");
    let sig = sign(SECRET, &body);

    let first = processor.process(GATEWAY, &body, &sig).await.unwrap();
    assert_eq!(first, WebhookOutcome::Processed);

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, PlanType::Pro);
    assert_eq!(plan.payment_status, PaymentStatus::Active);
    assert_eq!(plan.subscription_id.as_deref(), Some("sub_1"));

    // Re-delivery of the same external event id settles as skipped and
    // leaves plan state untouched.
    let second = processor.process(GATEWAY, &body, &sig).await.unwrap();
    assert_eq!(second, WebhookOutcome::Skipped);

    let row = db.get_webhook_event("evt_1").await.unwrap().unwrap();
    assert_eq!(row.processing_status, ProcessingStatus::Skipped);
    assert_eq!(row.event_type, "subscription.activated");
    assert_eq!(row.gateway, GATEWAY);

    let plan_after = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan_after.plan_type, PlanType::Pro);
    assert_eq!(plan_after.subscription_id.as_deref(), Some("sub_1"));

    cleanup(&db_path).await;
}

#[tokio::test]
async fn handler_error_is_recorded_but_acknowledged() {
    let (database_url, db_path) = temp_database_url("wherr");
    let db = castor::db::spawn(&database_url).await;
    let processor = WebhookProcessor::new(db.clone(), &gateway_config());

    // Activation without a user id cannot be applied.
    let body = json!({
        "id": "evt_nouser",
        "type": "subscription.activated",
        "data": { "subscription": { "entity": { "id": "sub_x" } } }
    })
    .to_string()
    .into_bytes();
    let sig = sign(SECRET, &body);

    let outcome = processor.process(GATEWAY, &body, &sig).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Failed(_)));

    let row = db.get_webhook_event("evt_nouser").await.unwrap().unwrap();
    assert_eq!(row.processing_status, ProcessingStatus::Failed);
    assert!(row.error.is_some());

    cleanup(&db_path).await;
}

#[tokio::test]
async fn payment_failed_marks_billing_and_skips_unknown_subscriptions() {
    let (database_url, db_path) = temp_database_url("whpay");
    let db = castor::db::spawn(&database_url).await;
    let processor = WebhookProcessor::new(db.clone(), &gateway_config());

    let user = Uuid::new_v4();
    db.activate_pro(ProActivation {
        user_id: user,
        subscription_id: "sub_pay".to_string(),
        expires_at: None,
        customer_id: None,
    })
    .await
    .unwrap();

    let body = json!({
        "id": "evt_payfail",
        "type": "payment.failed",
        "data": { "payment": { "entity": { "id": "pay_1", "subscription_id": "sub_pay" } } }
    })
    .to_string()
    .into_bytes();
    let sig = sign(SECRET, &body);
    let outcome = processor.process(GATEWAY, &body, &sig).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.payment_status, PaymentStatus::Failed);

    // Unknown subscription: logged, recorded as processed, no state change.
    let body = json!({
        "id": "evt_unknown_sub",
        "type": "payment.failed",
        "data": { "payment": { "entity": { "id": "pay_2", "subscription_id": "sub_ghost" } } }
    })
    .to_string()
    .into_bytes();
    let sig = sign(SECRET, &body);
    let outcome = processor.process(GATEWAY, &body, &sig).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);
    let row = db.get_webhook_event("evt_unknown_sub").await.unwrap().unwrap();
    assert_eq!(row.processing_status, ProcessingStatus::Processed);

    cleanup(&db_path).await;
}

#[tokio::test]
async fn cancellation_event_downgrades_via_subscription_lookup() {
    let (database_url, db_path) = temp_database_url("whcancel");
    let db = castor::db::spawn(&database_url).await;
    let processor = WebhookProcessor::new(db.clone(), &gateway_config());

    let user = Uuid::new_v4();
    db.activate_pro(ProActivation {
        user_id: user,
        subscription_id: "sub_bye".to_string(),
        expires_at: None,
        customer_id: None,
    })
    .await
    .unwrap();

    // No notes on the cancel event: the subscription lookup resolves the user.
    let body = json!({
        "id": "evt_bye",
        "type": "subscription.cancelled",
        "data": { "subscription": { "entity": { "id": "sub_bye", "status": "cancelled" } } }
    })
    .to_string()
    .into_bytes();
    let sig = sign(SECRET, &body);
    let outcome = processor.process(GATEWAY, &body, &sig).await.unwrap();
    assert_eq!(outcome, WebhookOutcome::Processed);

    let plan = db.get_user_plan(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, PlanType::Free);
    assert_eq!(plan.payment_status, PaymentStatus::Cancelled);

    cleanup(&db_path).await;
}
