//! Billing webhook ingestion: HMAC signature verification, idempotent event
//! recording, and plan-state mutation.

pub mod events;
pub mod processor;
pub mod signature;

pub use events::{GatewayEvent, PaymentEntity, SubscriptionEntity};
pub use processor::{WebhookOutcome, WebhookProcessor};
pub use signature::{sign, verify_signature};
