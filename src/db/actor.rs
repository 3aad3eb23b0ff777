use crate::db::models::{ActivationOutcome, DbInstance, DbUserPlan, DbWebhookEvent};
use crate::db::patch::{BillingPatch, InstanceCreate, OauthPatch, RuntimePatch};
use crate::db::schema::SQLITE_INIT;
use crate::db::{ProActivation, WebhookEventUpsert};
use crate::error::CastorError;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::{str::FromStr, time::Duration};
use tracing::info;
use uuid::Uuid;

type Reply<T> = RpcReplyPort<Result<T, CastorError>>;

#[derive(Debug)]
pub enum DbActorMessage {
    /// Insert a new instance row (API layer and tests).
    CreateInstance(InstanceCreate, Reply<()>),

    /// Fetch one instance row by id.
    LookupInstance(Uuid, Reply<Option<DbInstance>>),

    /// Bump `last_accessed_at` to now.
    TouchInstanceUsage(Uuid, Reply<()>),

    /// Patch the OAuth columns of an instance.
    PatchOauth(Uuid, OauthPatch, Reply<()>),

    /// Patch the runtime columns (status/pid/port/last_error) of an instance.
    PatchRuntime(Uuid, RuntimePatch, Reply<()>),

    /// All rows with `status = 'active'`.
    ListActiveInstances(Reply<Vec<DbInstance>>),

    /// Ids of rows stuck in `provisioning` since before the cutoff.
    ListStuckProvisioning(DateTime<Utc>, Reply<Vec<Uuid>>),

    /// Count of a user's `active` instances.
    CountActiveInstances(Uuid, Reply<u32>),

    /// Plan row for a user, if any.
    GetUserPlan(Uuid, Reply<Option<DbUserPlan>>),

    /// Plan row owning a gateway subscription id, if any.
    GetUserPlanBySubscription(String, Reply<Option<DbUserPlan>>),

    /// Atomically activate a Pro subscription (idempotent).
    ActivatePro(ProActivation, Reply<ActivationOutcome>),

    /// Patch a user's billing columns.
    PatchBilling(Uuid, BillingPatch, Reply<()>),

    /// Downgrade to Free and deactivate instances beyond the Free quota,
    /// oldest first. Returns the deactivated instance ids.
    HandlePlanCancellation(Uuid, Reply<Vec<Uuid>>),

    /// Insert or update a webhook event by external id.
    UpsertWebhookEvent(WebhookEventUpsert, Reply<()>),

    /// True when an external event id was already processed or skipped.
    IsEventProcessed(String, Reply<bool>),

    /// Fetch a webhook event row by external id (admin/tests).
    GetWebhookEvent(String, Reply<Option<DbWebhookEvent>>),
}

#[derive(Clone)]
pub struct DbActorHandle {
    actor: ActorRef<DbActorMessage>,
}

macro_rules! db_rpc {
    ($self:ident, $variant:ident $(, $arg:expr)*) => {
        ractor::call!($self.actor, DbActorMessage::$variant $(, $arg)*)
            .map_err(|e| CastorError::RactorError(format!(
                concat!("DbActor ", stringify!($variant), " RPC failed: {}"), e
            )))?
    };
}

impl DbActorHandle {
    pub async fn create_instance(&self, create: InstanceCreate) -> Result<(), CastorError> {
        db_rpc!(self, CreateInstance, create)
    }

    pub async fn lookup_instance(&self, id: Uuid) -> Result<Option<DbInstance>, CastorError> {
        db_rpc!(self, LookupInstance, id)
    }

    pub async fn touch_instance_usage(&self, id: Uuid) -> Result<(), CastorError> {
        db_rpc!(self, TouchInstanceUsage, id)
    }

    pub async fn patch_oauth(&self, id: Uuid, patch: OauthPatch) -> Result<(), CastorError> {
        db_rpc!(self, PatchOauth, id, patch)
    }

    pub async fn patch_runtime(&self, id: Uuid, patch: RuntimePatch) -> Result<(), CastorError> {
        db_rpc!(self, PatchRuntime, id, patch)
    }

    pub async fn list_active_instances(&self) -> Result<Vec<DbInstance>, CastorError> {
        db_rpc!(self, ListActiveInstances)
    }

    pub async fn list_stuck_provisioning(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, CastorError> {
        db_rpc!(self, ListStuckProvisioning, cutoff)
    }

    pub async fn count_active_instances(&self, user_id: Uuid) -> Result<u32, CastorError> {
        db_rpc!(self, CountActiveInstances, user_id)
    }

    pub async fn get_user_plan(&self, user_id: Uuid) -> Result<Option<DbUserPlan>, CastorError> {
        db_rpc!(self, GetUserPlan, user_id)
    }

    pub async fn get_user_plan_by_subscription(
        &self,
        subscription_id: impl Into<String>,
    ) -> Result<Option<DbUserPlan>, CastorError> {
        let subscription_id = subscription_id.into();
        db_rpc!(self, GetUserPlanBySubscription, subscription_id)
    }

    pub async fn activate_pro(
        &self,
        activation: ProActivation,
    ) -> Result<ActivationOutcome, CastorError> {
        db_rpc!(self, ActivatePro, activation)
    }

    pub async fn patch_billing(
        &self,
        user_id: Uuid,
        patch: BillingPatch,
    ) -> Result<(), CastorError> {
        db_rpc!(self, PatchBilling, user_id, patch)
    }

    pub async fn handle_plan_cancellation(&self, user_id: Uuid) -> Result<Vec<Uuid>, CastorError> {
        db_rpc!(self, HandlePlanCancellation, user_id)
    }

    pub async fn upsert_webhook_event(
        &self,
        upsert: WebhookEventUpsert,
    ) -> Result<(), CastorError> {
        db_rpc!(self, UpsertWebhookEvent, upsert)
    }

    pub async fn is_event_processed(
        &self,
        external_event_id: impl Into<String>,
    ) -> Result<bool, CastorError> {
        let external_event_id = external_event_id.into();
        db_rpc!(self, IsEventProcessed, external_event_id)
    }

    pub async fn get_webhook_event(
        &self,
        external_event_id: impl Into<String>,
    ) -> Result<Option<DbWebhookEvent>, CastorError> {
        let external_event_id = external_event_id.into();
        db_rpc!(self, GetWebhookEvent, external_event_id)
    }
}

pub(super) struct DbActorState {
    pub(super) pool: SqlitePool,
}

pub(super) struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let pool = &state.pool;
        match message {
            DbActorMessage::CreateInstance(create, reply) => {
                let _ = reply.send(create.insert(pool).await);
            }
            DbActorMessage::LookupInstance(id, reply) => {
                let _ = reply.send(self.lookup_instance(pool, id).await);
            }
            DbActorMessage::TouchInstanceUsage(id, reply) => {
                let _ = reply.send(self.touch_instance_usage(pool, id).await);
            }
            DbActorMessage::PatchOauth(id, patch, reply) => {
                let _ = reply.send(patch.apply(pool, id).await);
            }
            DbActorMessage::PatchRuntime(id, patch, reply) => {
                let _ = reply.send(patch.apply(pool, id).await);
            }
            DbActorMessage::ListActiveInstances(reply) => {
                let _ = reply.send(self.list_active_instances(pool).await);
            }
            DbActorMessage::ListStuckProvisioning(cutoff, reply) => {
                let _ = reply.send(self.list_stuck_provisioning(pool, cutoff).await);
            }
            DbActorMessage::CountActiveInstances(user_id, reply) => {
                let _ = reply.send(self.count_active_instances(pool, user_id).await);
            }
            DbActorMessage::GetUserPlan(user_id, reply) => {
                let _ = reply.send(self.get_user_plan(pool, user_id).await);
            }
            DbActorMessage::GetUserPlanBySubscription(subscription_id, reply) => {
                let _ = reply.send(
                    self.get_user_plan_by_subscription(pool, &subscription_id)
                        .await,
                );
            }
            DbActorMessage::ActivatePro(activation, reply) => {
                let _ = reply.send(self.activate_pro(pool, activation).await);
            }
            DbActorMessage::PatchBilling(user_id, patch, reply) => {
                let _ = reply.send(patch.apply(pool, user_id).await);
            }
            DbActorMessage::HandlePlanCancellation(user_id, reply) => {
                let _ = reply.send(self.handle_plan_cancellation(pool, user_id).await);
            }
            DbActorMessage::UpsertWebhookEvent(upsert, reply) => {
                let _ = reply.send(self.upsert_webhook_event(pool, upsert).await);
            }
            DbActorMessage::IsEventProcessed(external_id, reply) => {
                let _ = reply.send(self.is_event_processed(pool, &external_id).await);
            }
            DbActorMessage::GetWebhookEvent(external_id, reply) => {
                let _ = reply.send(self.get_webhook_event(pool, &external_id).await);
            }
        }
        Ok(())
    }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SQLITE_INIT).execute(pool).await?;
    Ok(())
}

/// Async spawn of the database actor and return a typed handle.
pub async fn spawn(database_url: &str) -> DbActorHandle {
    let (actor, _jh) = Actor::spawn(
        Some("CastorDb".to_string()),
        DbActor,
        database_url.to_string(),
    )
    .await
    .expect("failed to spawn DbActor");
    DbActorHandle { actor }
}
