//! Database module: the narrow query surface the control plane consumes.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: SQL DDL for initializing the database (SQLite-first)
//! - `patch.rs`: partial-update structs
//! - `queries.rs`: SQL behind the actor handlers
//! - `actor.rs`: ractor actor owning the pool, plus the typed handle

pub mod actor;
pub mod models;
pub mod patch;
pub mod schema;

mod queries;

pub use actor::{DbActorHandle, DbActorMessage, spawn};
pub use models::{
    ActivationOutcome, CredentialKind, DbInstance, DbUserPlan, DbWebhookEvent, InstanceStatus,
    OauthStatus, PaymentStatus, PlanType, ProcessingStatus,
};
pub use patch::{BillingPatch, InstanceCreate, OauthPatch, RuntimePatch};
pub use schema::SQLITE_INIT;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Arguments of the atomic Pro activation.
#[derive(Debug, Clone)]
pub struct ProActivation {
    pub user_id: Uuid,
    pub subscription_id: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
}

/// Insert-or-update payload for a webhook event row.
#[derive(Debug, Clone)]
pub struct WebhookEventUpsert {
    pub external_event_id: String,
    pub event_type: String,
    pub gateway: String,
    pub payload: String,
    pub status: ProcessingStatus,
    pub error: Option<String>,
}
