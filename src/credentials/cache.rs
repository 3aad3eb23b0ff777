use ahash::AHashMap;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::InstanceStatus;

/// Ephemeral, in-process view of an instance's credential. A strict subset of
/// the store row; the store stays authoritative. Never leaves the process.
#[derive(Debug)]
pub struct CachedCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub service_name: String,
    pub status: InstanceStatus,
    pub cached_at: DateTime<Utc>,
    last_used_at: AtomicI64,
    refresh_attempts: AtomicU32,
}

impl CachedCredential {
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
        user_id: Uuid,
        service_name: impl Into<String>,
        status: InstanceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            access_token,
            refresh_token,
            expires_at,
            user_id,
            service_name: service_name.into(),
            status,
            cached_at: now,
            last_used_at: AtomicI64::new(now.timestamp()),
            refresh_attempts: AtomicU32::new(0),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True when the token is usable past the given margin.
    pub fn fresh_for(&self, margin: chrono::Duration) -> bool {
        self.expires_at > Utc::now() + margin
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        let secs = self.last_used_at.load(Ordering::Relaxed);
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn refresh_attempts(&self) -> u32 {
        self.refresh_attempts.load(Ordering::Relaxed)
    }

    pub fn note_refresh_attempt(&self) {
        self.refresh_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.last_used_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }
}

/// Keyed credential cache: plain map, no size eviction; entries live until
/// expiry or invalidation. Entries are `Arc`ed with atomic usage counters so
/// hits only take the read lock.
#[derive(Debug, Default)]
pub struct CredentialCache {
    inner: RwLock<AHashMap<Uuid, Arc<CachedCredential>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiry-aware read: absent or expired entries miss; expired entries are
    /// purged on access. Hits bump `last_used_at`.
    pub fn get(&self, instance_id: Uuid) -> Option<Arc<CachedCredential>> {
        let entry = {
            let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
            map.get(&instance_id).cloned()
        }?;

        if entry.is_expired() {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            // Only purge the entry we saw; a refresh may have replaced it.
            let unchanged = map
                .get(&instance_id)
                .is_some_and(|current| Arc::ptr_eq(current, &entry));
            if unchanged {
                map.remove(&instance_id);
            }
            return None;
        }

        entry.touch();
        Some(entry)
    }

    /// Same expiry semantics as `get`, without the usage bump or the purge.
    pub fn peek(&self, instance_id: Uuid) -> Option<Arc<CachedCredential>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&instance_id)
            .filter(|entry| !entry.is_expired())
            .cloned()
    }

    pub fn put(&self, instance_id: Uuid, entry: CachedCredential) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(instance_id, Arc::new(entry));
    }

    pub fn invalidate(&self, instance_id: Uuid) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&instance_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
