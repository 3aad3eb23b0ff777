use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CastorError, OauthError};

/// Maximum age of an authorize-flow state blob before the callback rejects it.
pub const STATE_MAX_AGE_SECS: i64 = 600;

/// Round-trip payload carried through the provider's `state` parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBlob {
    pub instance_id: Uuid,
    pub user_id: Uuid,
    /// Unix seconds at authorize time.
    pub timestamp: i64,
    pub service: String,
}

impl StateBlob {
    pub fn new(instance_id: Uuid, user_id: Uuid, service: impl Into<String>) -> Self {
        Self {
            instance_id,
            user_id,
            timestamp: Utc::now().timestamp(),
            service: service.into(),
        }
    }

    /// base64url(JSON) without padding.
    pub fn encode(&self) -> Result<String, CastorError> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self, CastorError> {
        let bytes = URL_SAFE_NO_PAD.decode(raw.as_bytes()).map_err(|e| {
            CastorError::Oauth(OauthError::Flow {
                code: "INVALID_STATE".to_string(),
                message: format!("state parameter is not base64url: {e}"),
                details: None,
            })
        })?;
        let blob: Self = serde_json::from_slice(&bytes).map_err(|e| {
            CastorError::Oauth(OauthError::Flow {
                code: "INVALID_STATE".to_string(),
                message: format!("state parameter is not a valid payload: {e}"),
                details: None,
            })
        })?;
        Ok(blob)
    }

    /// Stale blobs are rejected to bound replay of leaked authorize URLs.
    pub fn is_stale(&self) -> bool {
        Utc::now().timestamp() - self.timestamp > STATE_MAX_AGE_SECS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let blob = StateBlob::new(Uuid::new_v4(), Uuid::new_v4(), "github");
        let encoded = blob.encode().unwrap();
        let decoded = StateBlob::decode(&encoded).unwrap();
        assert_eq!(blob, decoded);
        assert!(!decoded.is_stale());
    }

    #[test]
    fn stale_state_detected() {
        let mut blob = StateBlob::new(Uuid::new_v4(), Uuid::new_v4(), "notion");
        blob.timestamp -= STATE_MAX_AGE_SECS + 5;
        assert!(blob.is_stale());
    }

    #[test]
    fn garbage_state_rejected() {
        assert!(StateBlob::decode("not-base64!@#").is_err());
        let not_json = URL_SAFE_NO_PAD.encode(b"plain text");
        assert!(StateBlob::decode(&not_json).is_err());
    }
}
