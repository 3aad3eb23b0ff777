//! SQL behind the [`DbActor`](super::actor) message handlers.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::actor::DbActor;
use super::models::{
    ActivationOutcome, DbInstance, DbUserPlan, DbWebhookEvent, PlanType, ProcessingStatus,
};
use super::{ProActivation, WebhookEventUpsert};
use crate::error::CastorError;

impl DbActor {
    pub(super) async fn lookup_instance(
        &self,
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<Option<DbInstance>, CastorError> {
        let row = sqlx::query_as::<_, DbInstance>("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn touch_instance_usage(
        &self,
        pool: &SqlitePool,
        id: Uuid,
    ) -> Result<(), CastorError> {
        sqlx::query("UPDATE instances SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub(super) async fn list_active_instances(
        &self,
        pool: &SqlitePool,
    ) -> Result<Vec<DbInstance>, CastorError> {
        let rows =
            sqlx::query_as::<_, DbInstance>("SELECT * FROM instances WHERE status = 'active'")
                .fetch_all(pool)
                .await?;
        Ok(rows)
    }

    pub(super) async fn list_stuck_provisioning(
        &self,
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, CastorError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM instances WHERE status = 'provisioning' AND created_at < ?",
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
        Ok(ids)
    }

    pub(super) async fn count_active_instances(
        &self,
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<u32, CastorError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM instances WHERE user_id = ? AND status = 'active'",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub(super) async fn get_user_plan(
        &self,
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Option<DbUserPlan>, CastorError> {
        let row = sqlx::query_as::<_, DbUserPlan>("SELECT * FROM user_plans WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    pub(super) async fn get_user_plan_by_subscription(
        &self,
        pool: &SqlitePool,
        subscription_id: &str,
    ) -> Result<Option<DbUserPlan>, CastorError> {
        let row =
            sqlx::query_as::<_, DbUserPlan>("SELECT * FROM user_plans WHERE subscription_id = ?")
                .bind(subscription_id)
                .fetch_optional(pool)
                .await?;
        Ok(row)
    }

    /// Idempotent Pro activation: applying the same subscription twice
    /// returns `AlreadyActive` and leaves the row untouched.
    pub(super) async fn activate_pro(
        &self,
        pool: &SqlitePool,
        activation: ProActivation,
    ) -> Result<ActivationOutcome, CastorError> {
        let mut tx = pool.begin().await?;

        let current =
            sqlx::query_as::<_, DbUserPlan>("SELECT * FROM user_plans WHERE user_id = ?")
                .bind(activation.user_id)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(plan) = &current {
            let same_subscription =
                plan.subscription_id.as_deref() == Some(activation.subscription_id.as_str());
            if plan.plan_type == PlanType::Pro
                && plan.payment_status == super::models::PaymentStatus::Active
                && same_subscription
            {
                tx.commit().await?;
                return Ok(ActivationOutcome::AlreadyActive);
            }
        }

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO user_plans (
                user_id, plan_type, payment_status, subscription_id,
                customer_id, expires_at, created_at, updated_at
            )
            VALUES (?, 'pro', 'active', ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                plan_type = 'pro',
                payment_status = 'active',
                subscription_id = excluded.subscription_id,
                customer_id = excluded.customer_id,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(activation.user_id)
        .bind(&activation.subscription_id)
        .bind(&activation.customer_id)
        .bind(activation.expires_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ActivationOutcome::Activated)
    }

    /// Downgrade to Free, mark billing cancelled, and deactivate active
    /// instances beyond the Free quota. Deactivation order is
    /// `last_accessed_at` ascending, then `id` ascending (oldest first).
    pub(super) async fn handle_plan_cancellation(
        &self,
        pool: &SqlitePool,
        user_id: Uuid,
    ) -> Result<Vec<Uuid>, CastorError> {
        let mut tx = pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO user_plans (
                user_id, plan_type, payment_status, subscription_id,
                customer_id, expires_at, created_at, updated_at
            )
            VALUES (?, 'free', 'cancelled', NULL, NULL, NULL, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                plan_type = 'free',
                payment_status = 'cancelled',
                subscription_id = NULL,
                expires_at = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let active_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM instances
            WHERE user_id = ? AND status = 'active'
            ORDER BY last_accessed_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        let quota = PlanType::Free.max_instances() as usize;
        let excess = active_ids.len().saturating_sub(quota);
        let deactivated: Vec<Uuid> = active_ids.into_iter().take(excess).collect();

        for id in &deactivated {
            sqlx::query("UPDATE instances SET status = 'inactive' WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(deactivated)
    }

    pub(super) async fn upsert_webhook_event(
        &self,
        pool: &SqlitePool,
        upsert: WebhookEventUpsert,
    ) -> Result<(), CastorError> {
        let now = Utc::now();
        let processed_at = match upsert.status {
            ProcessingStatus::Pending => None,
            _ => Some(now),
        };
        sqlx::query(
            r#"
            INSERT INTO webhook_events (
                external_event_id, event_type, gateway, payload,
                processing_status, error, created_at, processed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_event_id) DO UPDATE SET
                processing_status = excluded.processing_status,
                error = excluded.error,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(&upsert.external_event_id)
        .bind(&upsert.event_type)
        .bind(&upsert.gateway)
        .bind(&upsert.payload)
        .bind(upsert.status)
        .bind(&upsert.error)
        .bind(now)
        .bind(processed_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub(super) async fn is_event_processed(
        &self,
        pool: &SqlitePool,
        external_id: &str,
    ) -> Result<bool, CastorError> {
        let seen = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM webhook_events
                WHERE external_event_id = ?
                  AND processing_status IN ('processed', 'skipped')
            )
            "#,
        )
        .bind(external_id)
        .fetch_one(pool)
        .await?;
        Ok(seen)
    }

    pub(super) async fn get_webhook_event(
        &self,
        pool: &SqlitePool,
        external_id: &str,
    ) -> Result<Option<DbWebhookEvent>, CastorError> {
        let row = sqlx::query_as::<_, DbWebhookEvent>(
            "SELECT * FROM webhook_events WHERE external_event_id = ?",
        )
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }
}
