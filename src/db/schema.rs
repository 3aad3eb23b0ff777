//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `instances` table (one per (user, service) bridge; unique active pair)
/// - `user_plans` table (one row per user)
/// - `webhook_events` table (append-only billing event log)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Instances (per-user, per-service MCP bridges)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    service_name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'oauth',
    status TEXT NOT NULL DEFAULT 'inactive',
    oauth_status TEXT NOT NULL DEFAULT 'n/a',
    client_id TEXT NULL,
    client_secret TEXT NULL,
    encrypted_credential_blob TEXT NULL,
    access_token TEXT NULL,
    refresh_token TEXT NULL,
    token_expires_at TEXT NULL, -- RFC3339
    pid INTEGER NULL,
    port INTEGER NULL,
    last_error TEXT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    last_accessed_at TEXT NOT NULL, -- RFC3339
    expires_at TEXT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_instances_user ON instances(user_id);
CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
-- At most one active bridge per (user, service).
CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_active_pair
    ON instances(user_id, service_name) WHERE status = 'active';

-- ---------------------------------------------------------------------------
-- User plans (one row per user; absent row = implicit Free)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_plans (
    user_id TEXT PRIMARY KEY NOT NULL,
    plan_type TEXT NOT NULL DEFAULT 'free',
    payment_status TEXT NOT NULL DEFAULT 'none',
    subscription_id TEXT NULL,
    customer_id TEXT NULL,
    expires_at TEXT NULL, -- RFC3339
    created_at TEXT NOT NULL, -- RFC3339
    updated_at TEXT NOT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_user_plans_subscription ON user_plans(subscription_id);

-- ---------------------------------------------------------------------------
-- Webhook events (append-only; external id is globally unique)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS webhook_events (
    id INTEGER PRIMARY KEY NOT NULL,
    external_event_id TEXT NOT NULL UNIQUE,
    event_type TEXT NOT NULL,
    gateway TEXT NOT NULL,
    payload TEXT NOT NULL,
    processing_status TEXT NOT NULL DEFAULT 'pending',
    error TEXT NULL,
    created_at TEXT NOT NULL, -- RFC3339
    processed_at TEXT NULL -- RFC3339
);

CREATE INDEX IF NOT EXISTS idx_webhook_events_status ON webhook_events(processing_status);
"#;
