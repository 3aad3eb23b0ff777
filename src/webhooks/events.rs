use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Billing event envelope: `{id, type, data: {subscription|payment|order|invoice: {entity: {…}}}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type", alias = "event")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    pub subscription: Option<EntityWrap<SubscriptionEntity>>,
    pub payment: Option<EntityWrap<PaymentEntity>>,
    pub order: Option<Value>,
    pub invoice: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityWrap<T> {
    pub entity: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntity {
    pub id: Option<String>,
    pub status: Option<String>,
    /// Epoch seconds of the end of the current billing period.
    pub current_end: Option<i64>,
    pub customer_id: Option<String>,
    #[serde(default)]
    pub notes: Value,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: Option<String>,
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub notes: Value,
}

impl SubscriptionEntity {
    /// The owning user, carried in `notes.user_id` (gateways that support
    /// free-form notes) or `metadata.user_id`.
    pub fn user_id(&self) -> Option<Uuid> {
        user_id_from(&self.notes).or_else(|| user_id_from(&self.metadata))
    }

    pub fn current_end_at(&self) -> Option<DateTime<Utc>> {
        self.current_end
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }
}

fn user_id_from(value: &Value) -> Option<Uuid> {
    value
        .get("user_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_subscription_event() {
        let user = Uuid::new_v4();
        let raw = json!({
            "id": "evt_42",
            "type": "subscription.activated",
            "data": {
                "subscription": {
                    "entity": {
                        "id": "sub_9",
                        "status": "active",
                        "current_end": 1_767_225_600,
                        "customer_id": "cust_3",
                        "notes": { "user_id": user.to_string() }
                    }
                }
            }
        });
        let event: GatewayEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, "subscription.activated");
        let sub = event.data.subscription.unwrap().entity;
        assert_eq!(sub.user_id(), Some(user));
        assert!(sub.current_end_at().is_some());
    }

    #[test]
    fn metadata_user_id_is_a_fallback() {
        let user = Uuid::new_v4();
        let sub: SubscriptionEntity = serde_json::from_value(json!({
            "id": "sub_1",
            "notes": [],
            "metadata": { "user_id": user.to_string() }
        }))
        .unwrap();
        assert_eq!(sub.user_id(), Some(user));
    }

    #[test]
    fn missing_user_id_is_none() {
        let sub: SubscriptionEntity = serde_json::from_value(json!({ "id": "sub_1" })).unwrap();
        assert_eq!(sub.user_id(), None);
    }
}
