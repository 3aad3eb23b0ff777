use ahash::AHashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::events::GatewayEvent;
use super::signature::verify_signature;
use crate::config::{WebhooksConfig, resolve_gateway_env};
use crate::db::{
    BillingPatch, DbActorHandle, PaymentStatus, ProActivation, ProcessingStatus,
    WebhookEventUpsert,
};
use crate::error::CastorError;

/// Final disposition of one delivery. Everything past signature verification
/// answers 200 so the gateway stops retrying business-logic failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Skipped,
    Failed(String),
}

/// Signature-verified, idempotent billing event ingestion.
pub struct WebhookProcessor {
    db: DbActorHandle,
    secrets: AHashMap<String, String>,
    /// Serializes deliveries that share an external event id; distinct ids
    /// proceed in parallel.
    guards: Mutex<AHashMap<String, Arc<Mutex<()>>>>,
}

impl WebhookProcessor {
    pub fn new(db: DbActorHandle, webhooks: &WebhooksConfig) -> Self {
        let secrets = webhooks
            .iter()
            .map(|(name, cfg)| (name.clone(), resolve_gateway_env(name, cfg).secret))
            .filter(|(_, secret)| !secret.is_empty())
            .collect();
        Self {
            db,
            secrets,
            guards: Mutex::new(AHashMap::new()),
        }
    }

    /// Verify, deduplicate, dispatch, and record one delivery.
    pub async fn process(
        &self,
        gateway: &str,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, CastorError> {
        let Some(secret) = self.secrets.get(gateway) else {
            warn!(gateway, "webhook for unconfigured gateway rejected");
            return Err(CastorError::SignatureInvalid);
        };
        if !verify_signature(secret, body, signature) {
            warn!(gateway, "webhook signature verification failed");
            return Err(CastorError::SignatureInvalid);
        }

        let event: GatewayEvent = serde_json::from_slice(body)?;
        let payload = String::from_utf8_lossy(body).into_owned();

        let guard = self.guard(&event.id).await;
        let outcome = {
            let _held = guard.lock().await;
            self.process_event(gateway, &event, &payload).await
        };
        self.release_guard(&event.id, &guard).await;
        outcome
    }

    /// The guarded section: deliveries sharing an external event id run this
    /// one at a time.
    async fn process_event(
        &self,
        gateway: &str,
        event: &GatewayEvent,
        payload: &str,
    ) -> Result<WebhookOutcome, CastorError> {
        // Idempotency: a previously settled event is re-recorded as skipped
        // and produces no further side effects.
        if self.db.is_event_processed(event.id.clone()).await? {
            info!(gateway, event_id = %event.id, "duplicate event skipped");
            self.record(gateway, event, payload, ProcessingStatus::Skipped, None)
                .await?;
            return Ok(WebhookOutcome::Skipped);
        }

        self.record(gateway, event, payload, ProcessingStatus::Pending, None)
            .await?;

        match self.dispatch(gateway, event).await {
            Ok(()) => {
                self.record(gateway, event, payload, ProcessingStatus::Processed, None)
                    .await?;
                Ok(WebhookOutcome::Processed)
            }
            Err(e) => {
                let detail = e.to_string();
                warn!(gateway, event_id = %event.id, "webhook handler failed: {}", detail);
                self.record(
                    gateway,
                    event,
                    payload,
                    ProcessingStatus::Failed,
                    Some(detail.clone()),
                )
                .await?;
                Ok(WebhookOutcome::Failed(detail))
            }
        }
    }

    async fn dispatch(&self, gateway: &str, event: &GatewayEvent) -> Result<(), CastorError> {
        match event.event_type.as_str() {
            "subscription.activated" | "subscription.authenticated" => {
                self.on_subscription_activated(event).await
            }
            "subscription.cancelled" => self.on_subscription_cancelled(event).await,
            "payment.failed" => self.on_payment_failed(event).await,
            "subscription.charged"
            | "subscription.completed"
            | "payment.authorized"
            | "order.paid"
            | "invoice.paid" => {
                info!(gateway, event_id = %event.id, kind = %event.event_type, "billing event recorded");
                Ok(())
            }
            other => {
                info!(gateway, event_id = %event.id, kind = %other, "unhandled billing event recorded");
                Ok(())
            }
        }
    }

    async fn on_subscription_activated(&self, event: &GatewayEvent) -> Result<(), CastorError> {
        let sub = event
            .data
            .subscription
            .as_ref()
            .map(|w| &w.entity)
            .ok_or_else(|| CastorError::UnexpectedError("missing subscription entity".into()))?;
        let user_id = sub.user_id().ok_or_else(|| {
            CastorError::UnexpectedError("subscription carries no user_id in notes/metadata".into())
        })?;
        let subscription_id = sub
            .id
            .clone()
            .ok_or_else(|| CastorError::UnexpectedError("subscription entity has no id".into()))?;

        let outcome = self
            .db
            .activate_pro(ProActivation {
                user_id,
                subscription_id: subscription_id.clone(),
                expires_at: sub.current_end_at(),
                customer_id: sub.customer_id.clone(),
            })
            .await?;
        info!(
            %user_id,
            subscription_id = %subscription_id,
            ?outcome,
            "pro plan activation applied"
        );
        Ok(())
    }

    async fn on_subscription_cancelled(&self, event: &GatewayEvent) -> Result<(), CastorError> {
        let sub = event
            .data
            .subscription
            .as_ref()
            .map(|w| &w.entity)
            .ok_or_else(|| CastorError::UnexpectedError("missing subscription entity".into()))?;

        // Prefer the embedded user id; fall back to the subscription lookup.
        let user_id = match sub.user_id() {
            Some(user_id) => user_id,
            None => {
                let subscription_id = sub.id.clone().ok_or_else(|| {
                    CastorError::UnexpectedError("subscription entity has no id".into())
                })?;
                self.db
                    .get_user_plan_by_subscription(subscription_id.clone())
                    .await?
                    .map(|plan| plan.user_id)
                    .ok_or_else(|| {
                        CastorError::UnexpectedError(format!(
                            "no plan owns subscription {subscription_id}"
                        ))
                    })?
            }
        };

        let deactivated = self.db.handle_plan_cancellation(user_id).await?;
        info!(
            %user_id,
            deactivated = deactivated.len(),
            "plan downgraded to free after cancellation"
        );
        Ok(())
    }

    async fn on_payment_failed(&self, event: &GatewayEvent) -> Result<(), CastorError> {
        let subscription_id = event
            .data
            .payment
            .as_ref()
            .and_then(|w| w.entity.subscription_id.clone())
            .or_else(|| {
                event
                    .data
                    .subscription
                    .as_ref()
                    .and_then(|w| w.entity.id.clone())
            });

        let Some(subscription_id) = subscription_id else {
            warn!(event_id = %event.id, "payment.failed without subscription id, skipping");
            return Ok(());
        };

        match self
            .db
            .get_user_plan_by_subscription(subscription_id.clone())
            .await?
        {
            Some(plan) => {
                self.db
                    .patch_billing(
                        plan.user_id,
                        BillingPatch {
                            payment_status: Some(PaymentStatus::Failed),
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(user_id = %plan.user_id, %subscription_id, "billing marked failed");
            }
            None => {
                // Unknown subscription: logged and skipped by design of the
                // billing flow; the row is still recorded as processed.
                warn!(%subscription_id, "payment.failed for unknown subscription, skipping");
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        gateway: &str,
        event: &GatewayEvent,
        payload: &str,
        status: ProcessingStatus,
        error: Option<String>,
    ) -> Result<(), CastorError> {
        self.db
            .upsert_webhook_event(WebhookEventUpsert {
                external_event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                gateway: gateway.to_string(),
                payload: payload.to_string(),
                status,
                error,
            })
            .await
    }

    async fn guard(&self, event_id: &str) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(event_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the guard entry once no other delivery holds it (two strong refs:
    /// the map's and ours). Cloning requires the outer lock, so the check
    /// cannot race a new waiter.
    async fn release_guard(&self, event_id: &str, guard: &Arc<Mutex<()>>) {
        let mut guards = self.guards.lock().await;
        let idle = guards
            .get(event_id)
            .is_some_and(|current| Arc::ptr_eq(current, guard) && Arc::strong_count(current) == 2);
        if idle {
            guards.remove(event_id);
        }
    }
}
