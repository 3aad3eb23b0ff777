use ahash::AHashMap;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::audit::{self, AuditOperation};
use super::cache::{CachedCredential, CredentialCache};
use crate::db::{DbActorHandle, DbInstance, InstanceStatus, OauthPatch, OauthStatus};
use crate::error::{IsRetryable, OauthError, ResolveError};
use crate::oauth::{ProviderOauth, TokenBundle};
use crate::registry::ServiceRegistry;

/// Tokens closer than this to expiry are refreshed before being handed out.
pub const TOKEN_FRESH_MARGIN: ChronoDuration = ChronoDuration::minutes(5);

/// Cache lifetime for non-expiring credentials (API keys).
const API_KEY_CACHE_TTL: ChronoDuration = ChronoDuration::hours(1);

/// Upstream token endpoints are retried on transient failures only.
static OAUTH_RETRY_POLICY: LazyLock<ExponentialBuilder> = LazyLock::new(|| {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(2)
});

/// A usable bearer handed to the auth gate. `expires_at` is always in the
/// future at hand-out time.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub instance_id: Uuid,
    pub user_id: Uuid,
    pub service_name: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Credential resolution with on-miss store hydration and single-flight
/// upstream refresh. Owns the cache; the cache knows nothing about refresh.
pub struct TokenResolver {
    db: DbActorHandle,
    registry: Arc<ServiceRegistry>,
    cache: CredentialCache,
    http: reqwest::Client,
    guards: Mutex<AHashMap<Uuid, Arc<Mutex<()>>>>,
    limiter: DefaultDirectRateLimiter,
}

impl TokenResolver {
    pub fn new(db: DbActorHandle, registry: Arc<ServiceRegistry>, http: reqwest::Client) -> Self {
        // One refresh per second with a small burst is far above any honest
        // per-process demand and keeps a provider outage from amplifying.
        let quota = Quota::per_second(NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN));
        Self {
            db,
            registry,
            cache: CredentialCache::new(),
            http,
            guards: Mutex::new(AHashMap::new()),
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Resolve a usable bearer for the instance.
    ///
    /// Fast path is a cache hit with more than [`TOKEN_FRESH_MARGIN`] left.
    /// Everything else happens under the per-instance guard: store hydration,
    /// validation, and at most one in-flight upstream refresh per instance;
    /// concurrent callers await the guard and then hit the refreshed cache.
    pub async fn resolve(&self, instance_id: Uuid) -> Result<ResolvedCredential, ResolveError> {
        if let Some(entry) = self.cache.get(instance_id) {
            if entry.fresh_for(TOKEN_FRESH_MARGIN) {
                return Ok(to_resolved(instance_id, &entry));
            }
        }

        let guard = self.guard(instance_id).await;
        let result = {
            let _held = guard.lock().await;
            self.resolve_under_guard(instance_id).await
        };
        self.release_guard(instance_id, &guard).await;
        result
    }

    async fn resolve_under_guard(
        &self,
        instance_id: Uuid,
    ) -> Result<ResolvedCredential, ResolveError> {
        // A concurrent caller may have refreshed while we waited.
        if let Some(entry) = self.cache.get(instance_id) {
            if entry.fresh_for(TOKEN_FRESH_MARGIN) {
                return Ok(to_resolved(instance_id, &entry));
            }
        }

        let instance = self
            .db
            .lookup_instance(instance_id)
            .await
            .map_err(ResolveError::Internal)?
            .ok_or(ResolveError::InstanceNotFound)?;

        let spec = self
            .registry
            .get(&instance.service_name)
            .ok_or_else(|| ResolveError::ServiceDisabled(instance.service_name.clone()))?;
        if !spec.enabled {
            return Err(ResolveError::ServiceDisabled(instance.service_name.clone()));
        }

        match instance.status {
            InstanceStatus::Inactive | InstanceStatus::Revoked => {
                return Err(ResolveError::InstancePaused);
            }
            _ => {}
        }

        if spec.is_oauth()
            && instance.kind == crate::db::CredentialKind::Oauth
            && instance.oauth_status != OauthStatus::Completed
        {
            return Err(ResolveError::OauthRequired);
        }

        // Stored token still fresh: hydrate the cache and hand it out.
        if instance.token_fresh(TOKEN_FRESH_MARGIN) {
            let entry = entry_from_instance(&instance);
            let resolved = to_resolved(instance_id, &entry);
            self.cache.put(instance_id, entry);
            audit::success(instance_id, instance.user_id, AuditOperation::Resolve);
            debug!(%instance_id, "credential hydrated from store");
            return Ok(resolved);
        }

        if instance.kind == crate::db::CredentialKind::ApiKey {
            return self.resolve_api_key(&instance);
        }

        match &instance.refresh_token {
            Some(refresh_token) if !refresh_token.is_empty() => {
                self.refresh_oauth(&instance, refresh_token).await
            }
            _ => {
                if instance.access_token.is_some() {
                    // Token exists but is expiring and there is no way to renew it.
                    audit::failure(
                        instance_id,
                        instance.user_id,
                        AuditOperation::ReauthRequired,
                        "access token expiring and no refresh token on file",
                    );
                    Err(ResolveError::ReauthRequired)
                } else {
                    Err(ResolveError::NoCredential)
                }
            }
        }
    }

    fn resolve_api_key(&self, instance: &DbInstance) -> Result<ResolvedCredential, ResolveError> {
        let Some(key) = instance.access_token.as_ref().filter(|k| !k.is_empty()) else {
            return Err(ResolveError::NoCredential);
        };
        let entry = CachedCredential::new(
            key.clone(),
            None,
            Utc::now() + API_KEY_CACHE_TTL,
            instance.user_id,
            instance.service_name.clone(),
            instance.status,
        );
        let resolved = to_resolved(instance.id, &entry);
        self.cache.put(instance.id, entry);
        audit::success(instance.id, instance.user_id, AuditOperation::Resolve);
        Ok(resolved)
    }

    async fn refresh_oauth(
        &self,
        instance: &DbInstance,
        refresh_token: &str,
    ) -> Result<ResolvedCredential, ResolveError> {
        let spec = self
            .registry
            .get(&instance.service_name)
            .ok_or_else(|| ResolveError::ServiceDisabled(instance.service_name.clone()))?;

        let provider = ProviderOauth::new(
            &spec,
            instance.client_id.as_deref(),
            instance.client_secret.as_deref(),
            None,
        )
        .map_err(ResolveError::Internal)?;

        self.limiter.until_ready().await;

        let outcome = (|| async { provider.refresh(refresh_token, &self.http).await })
            .retry(*OAUTH_RETRY_POLICY)
            .when(|e: &OauthError| e.is_retryable())
            .notify(|err: &OauthError, dur: Duration| {
                warn!(
                    instance_id = %instance.id,
                    "token refresh retrying after {:?}: {}",
                    dur,
                    err
                );
            })
            .await;

        match outcome {
            Ok(bundle) => {
                self.commit_refresh(instance, &bundle).await?;
                audit::success(instance.id, instance.user_id, AuditOperation::Refresh);
                info!(
                    instance_id = %instance.id,
                    service = %instance.service_name,
                    "access token refreshed successfully"
                );
                let entry = CachedCredential::new(
                    bundle.access_token,
                    bundle
                        .refresh_token
                        .or_else(|| Some(refresh_token.to_string())),
                    bundle.expires_at,
                    instance.user_id,
                    instance.service_name.clone(),
                    instance.status,
                );
                let resolved = to_resolved(instance.id, &entry);
                self.cache.put(instance.id, entry);
                Ok(resolved)
            }
            Err(err) if err.is_permanent() => {
                error!(
                    instance_id = %instance.id,
                    service = %instance.service_name,
                    "refresh token rejected permanently: {}",
                    err
                );
                let patch = OauthPatch {
                    oauth_status: Some(OauthStatus::Expired),
                    ..Default::default()
                };
                self.db
                    .patch_oauth(instance.id, patch)
                    .await
                    .map_err(ResolveError::Internal)?;
                self.cache.invalidate(instance.id);
                audit::failure(
                    instance.id,
                    instance.user_id,
                    AuditOperation::ReauthRequired,
                    "refresh token expired or revoked",
                );
                Err(ResolveError::ReauthRequired)
            }
            Err(err) => {
                if let Some(entry) = self.cache.peek(instance.id) {
                    entry.note_refresh_attempt();
                }
                // Token-endpoint bodies can embed live tokens; the surfaced
                // detail only ever carries the masked form.
                let detail = masked_detail(&err);
                audit::failure(
                    instance.id,
                    instance.user_id,
                    AuditOperation::Refresh,
                    &detail,
                );
                Err(ResolveError::RefreshFailed { detail })
            }
        }
    }

    /// Persist a successful refresh; the store row stays authoritative.
    async fn commit_refresh(
        &self,
        instance: &DbInstance,
        bundle: &TokenBundle,
    ) -> Result<(), ResolveError> {
        let patch = OauthPatch {
            oauth_status: Some(OauthStatus::Completed),
            access_token: Some(bundle.access_token.clone()),
            refresh_token: bundle.refresh_token.clone(),
            token_expires_at: Some(bundle.expires_at),
        };
        self.db
            .patch_oauth(instance.id, patch)
            .await
            .map_err(ResolveError::Internal)
    }

    async fn guard(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().await;
        guards
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the guard entry once no other caller holds it (two strong refs:
    /// the map's and ours). Cloning requires the outer lock, so the check
    /// cannot race a new waiter.
    async fn release_guard(&self, instance_id: Uuid, guard: &Arc<Mutex<()>>) {
        let mut guards = self.guards.lock().await;
        let idle = guards
            .get(&instance_id)
            .is_some_and(|current| Arc::ptr_eq(current, guard) && Arc::strong_count(current) == 2);
        if idle {
            guards.remove(&instance_id);
        }
    }
}

/// Render a refresh failure for audit logs and client-facing detail. The
/// `Parse` variant carries raw response-body text which may include tokens,
/// so only its masked form is ever surfaced.
fn masked_detail(err: &OauthError) -> String {
    match err {
        OauthError::Parse { message, body } => format!(
            "OAuth2 token endpoint parse error: {message}. Body: {}",
            audit::mask_secret(body)
        ),
        other => other.to_string(),
    }
}

fn entry_from_instance(instance: &DbInstance) -> CachedCredential {
    CachedCredential::new(
        instance.access_token.clone().unwrap_or_default(),
        instance.refresh_token.clone(),
        instance
            .token_expires_at
            .unwrap_or_else(|| Utc::now() + API_KEY_CACHE_TTL),
        instance.user_id,
        instance.service_name.clone(),
        instance.status,
    )
}

fn to_resolved(instance_id: Uuid, entry: &CachedCredential) -> ResolvedCredential {
    ResolvedCredential {
        instance_id,
        user_id: entry.user_id,
        service_name: entry.service_name.clone(),
        access_token: entry.access_token.clone(),
        expires_at: entry.expires_at,
    }
}
