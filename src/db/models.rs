use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::FromRow;
use uuid::Uuid;

/// Credential shape of an instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Oauth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceStatus {
    Inactive,
    Provisioning,
    Active,
    Failed,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OauthStatus {
    #[serde(rename = "n/a")]
    #[sqlx(rename = "n/a")]
    NotApplicable,
    Pending,
    Completed,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PlanType {
    Free,
    Pro,
}

impl PlanType {
    /// Quota of concurrently active instances granted by the plan.
    pub fn max_instances(self) -> u32 {
        match self {
            PlanType::Free => 1,
            PlanType::Pro => 5,
        }
    }

    /// Feature flags derived from the plan; never stored.
    pub fn features(self) -> Value {
        match self {
            PlanType::Free => json!({ "priority_support": false, "concurrent_workers": 1 }),
            PlanType::Pro => json!({ "priority_support": true, "concurrent_workers": 5 }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentStatus {
    None,
    Active,
    Failed,
    Cancelled,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processed,
    Skipped,
    Failed,
}

/// One configured (user, service) bridge. The store row is authoritative; the
/// credential cache holds a derived subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DbInstance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_name: String,
    pub kind: CredentialKind,
    pub status: InstanceStatus,
    pub oauth_status: OauthStatus,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub encrypted_credential_blob: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub pid: Option<i64>,
    pub port: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl DbInstance {
    /// True when the stored access token is still usable past `margin`.
    pub fn token_fresh(&self, margin: chrono::Duration) -> bool {
        match (&self.access_token, self.token_expires_at) {
            (Some(token), Some(expiry)) => !token.is_empty() && expiry > Utc::now() + margin,
            _ => false,
        }
    }
}

/// One row per user; absent row means an implicit Free plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DbUserPlan {
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub payment_status: PaymentStatus,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DbUserPlan {
    /// The implicit plan for users without a row.
    pub fn default_free(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            plan_type: PlanType::Free,
            payment_status: PaymentStatus::None,
            subscription_id: None,
            customer_id: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Append-only record of a received billing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DbWebhookEvent {
    pub id: i64,
    pub external_event_id: String,
    pub event_type: String,
    pub gateway: String,
    pub payload: String,
    pub processing_status: ProcessingStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of the atomic Pro-plan activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    Activated,
    AlreadyActive,
}
