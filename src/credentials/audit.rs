//! Structured audit trail for credential operations.
//!
//! Every refresh outcome and every re-auth escalation emits one record on the
//! `credential_audit` target so operators can filter them independently of
//! application logs. Token values never appear here.

use tracing::{info, warn};
use uuid::Uuid;

/// Short, greppable operation names.
#[derive(Debug, Clone, Copy)]
pub enum AuditOperation {
    Refresh,
    ReauthRequired,
    Resolve,
}

impl AuditOperation {
    fn as_str(self) -> &'static str {
        match self {
            AuditOperation::Refresh => "refresh",
            AuditOperation::ReauthRequired => "reauth_required",
            AuditOperation::Resolve => "resolve",
        }
    }
}

pub fn success(instance_id: Uuid, user_id: Uuid, operation: AuditOperation) {
    info!(
        target: "credential_audit",
        %instance_id,
        %user_id,
        operation = operation.as_str(),
        status = "ok",
    );
}

pub fn failure(instance_id: Uuid, user_id: Uuid, operation: AuditOperation, error: &str) {
    warn!(
        target: "credential_audit",
        %instance_id,
        %user_id,
        operation = operation.as_str(),
        status = "error",
        error = %error,
    );
}

/// Keep a recognizable prefix for correlation, drop the secret tail.
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_keeps_only_prefix() {
        assert_eq!(mask_secret("ya29.a0AfH6SMB"), "ya29****");
        assert_eq!(mask_secret("ab"), "****");
        assert_eq!(mask_secret(""), "****");
    }
}
