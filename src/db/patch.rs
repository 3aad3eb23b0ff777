use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::models::{CredentialKind, InstanceStatus, OauthStatus, PaymentStatus, PlanType};
use crate::error::CastorError;

/// Full column set for inserting a new instance row. Created by the API layer
/// and by tests; the core only transitions existing rows.
#[derive(Debug, Clone)]
pub struct InstanceCreate {
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
    pub expires_at: Option<DateTime<Utc>>,
}

impl InstanceCreate {
    /// A minimal OAuth instance awaiting authorization.
    pub fn oauth(id: Uuid, user_id: Uuid, service_name: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            service_name: service_name.into(),
            kind: CredentialKind::Oauth,
            status: InstanceStatus::Active,
            oauth_status: OauthStatus::Pending,
            client_id: None,
            client_secret: None,
            encrypted_credential_blob: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            expires_at: None,
        }
    }

    pub(crate) async fn insert(self, pool: &SqlitePool) -> Result<(), CastorError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO instances (
                id, user_id, service_name, kind, status, oauth_status,
                client_id, client_secret, encrypted_credential_blob,
                access_token, refresh_token, token_expires_at,
                created_at, last_accessed_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(self.id)
        .bind(self.user_id)
        .bind(self.service_name)
        .bind(self.kind)
        .bind(self.status)
        .bind(self.oauth_status)
        .bind(self.client_id)
        .bind(self.client_secret)
        .bind(self.encrypted_credential_blob)
        .bind(self.access_token)
        .bind(self.refresh_token)
        .bind(self.token_expires_at)
        .bind(now)
        .bind(now)
        .bind(self.expires_at)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Partial update of the OAuth columns of an instance row.
#[derive(Debug, Clone, Default)]
pub struct OauthPatch {
    pub oauth_status: Option<OauthStatus>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

impl OauthPatch {
    pub(crate) async fn apply(&self, pool: &SqlitePool, id: Uuid) -> Result<(), CastorError> {
        if self.oauth_status.is_none()
            && self.access_token.is_none()
            && self.refresh_token.is_none()
            && self.token_expires_at.is_none()
        {
            return Ok(());
        }

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE instances SET ");
        let mut sep = qb.separated(", ");
        if let Some(status) = self.oauth_status {
            sep.push("oauth_status = ");
            sep.push_bind_unseparated(status);
        }
        if let Some(token) = &self.access_token {
            sep.push("access_token = ");
            sep.push_bind_unseparated(token.clone());
        }
        if let Some(token) = &self.refresh_token {
            sep.push("refresh_token = ");
            sep.push_bind_unseparated(token.clone());
        }
        if let Some(expiry) = self.token_expires_at {
            sep.push("token_expires_at = ");
            sep.push_bind_unseparated(expiry);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.build().execute(pool).await?;
        Ok(())
    }
}

/// Partial update of the runtime columns the supervisor owns.
#[derive(Debug, Clone, Default)]
pub struct RuntimePatch {
    pub status: Option<InstanceStatus>,
    pub pid: Option<i64>,
    pub port: Option<i64>,
    pub last_error: Option<String>,
    /// Clear pid/port regardless of the fields above.
    pub clear_runtime: bool,
}

impl RuntimePatch {
    pub(crate) async fn apply(&self, pool: &SqlitePool, id: Uuid) -> Result<(), CastorError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE instances SET ");
        let mut sep = qb.separated(", ");
        let mut any = false;
        if let Some(status) = self.status {
            sep.push("status = ");
            sep.push_bind_unseparated(status);
            any = true;
        }
        if self.clear_runtime {
            sep.push("pid = NULL");
            sep.push("port = NULL");
            any = true;
        } else {
            if let Some(pid) = self.pid {
                sep.push("pid = ");
                sep.push_bind_unseparated(pid);
                any = true;
            }
            if let Some(port) = self.port {
                sep.push("port = ");
                sep.push_bind_unseparated(port);
                any = true;
            }
        }
        if let Some(err) = &self.last_error {
            sep.push("last_error = ");
            sep.push_bind_unseparated(err.clone());
            any = true;
        }
        if !any {
            return Ok(());
        }
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.build().execute(pool).await?;
        Ok(())
    }
}

/// Partial update of a user's billing columns.
#[derive(Debug, Clone, Default)]
pub struct BillingPatch {
    pub plan_type: Option<PlanType>,
    pub payment_status: Option<PaymentStatus>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BillingPatch {
    pub(crate) async fn apply(&self, pool: &SqlitePool, user_id: Uuid) -> Result<(), CastorError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE user_plans SET ");
        let mut sep = qb.separated(", ");
        let mut any = false;
        if let Some(plan) = self.plan_type {
            sep.push("plan_type = ");
            sep.push_bind_unseparated(plan);
            any = true;
        }
        if let Some(status) = self.payment_status {
            sep.push("payment_status = ");
            sep.push_bind_unseparated(status);
            any = true;
        }
        if let Some(sub) = &self.subscription_id {
            sep.push("subscription_id = ");
            sep.push_bind_unseparated(sub.clone());
            any = true;
        }
        if let Some(customer) = &self.customer_id {
            sep.push("customer_id = ");
            sep.push_bind_unseparated(customer.clone());
            any = true;
        }
        if let Some(expiry) = self.expires_at {
            sep.push("expires_at = ");
            sep.push_bind_unseparated(expiry);
            any = true;
        }
        if !any {
            return Ok(());
        }
        sep.push("updated_at = ");
        sep.push_bind_unseparated(Utc::now());
        qb.push(" WHERE user_id = ");
        qb.push_bind(user_id);
        qb.build().execute(pool).await?;
        Ok(())
    }
}
