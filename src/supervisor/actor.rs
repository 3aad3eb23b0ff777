use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::probe::{health_pass, wait_until_ready};
use super::ports::PortAllocator;
use super::record::{WorkerEvent, WorkerState, WorkerStatus};
use super::spawner::{ChildCommand, spawn_worker};
use crate::config::SupervisorConfig;
use crate::db::{DbActorHandle, DbInstance, InstanceStatus, PlanType, RuntimePatch};
use crate::error::CastorError;
use crate::registry::ServiceRegistry;

/// Recovery window after a worker turns `degraded` before it is failed.
const DEGRADE_GRACE: Duration = Duration::from_secs(5);

/// Consecutive failed health passes before a worker turns `degraded`.
const DEGRADE_THRESHOLD: u8 = 2;

/// Why a worker is being terminated; decides the store transition once the
/// exit is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminateReason {
    /// Explicit Stop: row becomes `inactive`.
    Stop,
    /// Health checks failed for good: row becomes `failed`.
    HealthFailure { restart: bool },
    /// No matching active store row: row untouched.
    Reconcile,
    /// Process shutdown: runtime cleared, status untouched.
    Shutdown,
}

/// Startup attempt failure, with retryability decided at the source.
#[derive(Debug)]
pub struct AttemptError {
    pub message: String,
    /// Fatal failures (ineligible instance, unknown service) skip the retry
    /// budget entirely.
    pub fatal: bool,
}

#[derive(Debug)]
pub enum SupervisorMessage {
    /// Idempotent start; callers attach to an in-flight start of the same
    /// instance and all observe the same outcome.
    Start(Uuid, RpcReplyPort<Result<WorkerStatus, CastorError>>),

    /// Idempotent stop; missing workers succeed immediately.
    Stop(Uuid, RpcReplyPort<()>),

    /// Snapshot of one worker record.
    Status(Uuid, RpcReplyPort<Option<WorkerStatus>>),

    /// Snapshot of every worker record.
    ListWorkers(RpcReplyPort<Vec<WorkerStatus>>),

    /// Stop all workers within the shutdown budget.
    Shutdown(RpcReplyPort<()>),

    /// Periodic ticks (health pass, reconciliation).
    RunHealthPass,
    RunReconcile,

    // Internal messages (sent by the actor itself or its tasks)
    StartAttempt(Uuid),
    AttemptSpawned {
        instance_id: Uuid,
        attempt: u64,
        pid: u32,
        commands: mpsc::Sender<ChildCommand>,
    },
    AttemptDone {
        instance_id: Uuid,
        attempt: u64,
        result: Result<(), AttemptError>,
    },
    ProcessExited {
        instance_id: Uuid,
        pid: u32,
        exit_code: Option<i32>,
    },
    ProcessError {
        instance_id: Uuid,
        message: String,
    },
    HealthDone {
        instance_id: Uuid,
        attempt: u64,
        outcome: Result<(), String>,
        /// Set for the post-degrade recheck so a still-failing worker is
        /// finalized instead of merely counted.
        finalizing: bool,
    },
    DegradeElapsed {
        instance_id: Uuid,
        attempt: u64,
    },
    ReconcileData {
        active: Vec<DbInstance>,
        stuck: Vec<Uuid>,
    },
    ShutdownDeadline,
}

/// Handle for interacting with the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    actor: ActorRef<SupervisorMessage>,
    events: broadcast::Sender<WorkerEvent>,
}

impl SupervisorHandle {
    pub async fn start(&self, instance_id: Uuid) -> Result<WorkerStatus, CastorError> {
        ractor::call!(self.actor, SupervisorMessage::Start, instance_id)
            .map_err(|e| CastorError::RactorError(format!("Supervisor Start RPC failed: {e}")))?
    }

    pub async fn stop(&self, instance_id: Uuid) -> Result<(), CastorError> {
        ractor::call!(self.actor, SupervisorMessage::Stop, instance_id)
            .map_err(|e| CastorError::RactorError(format!("Supervisor Stop RPC failed: {e}")))
    }

    pub async fn status(&self, instance_id: Uuid) -> Result<Option<WorkerStatus>, CastorError> {
        ractor::call!(self.actor, SupervisorMessage::Status, instance_id)
            .map_err(|e| CastorError::RactorError(format!("Supervisor Status RPC failed: {e}")))
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerStatus>, CastorError> {
        ractor::call!(self.actor, SupervisorMessage::ListWorkers).map_err(|e| {
            CastorError::RactorError(format!("Supervisor ListWorkers RPC failed: {e}"))
        })
    }

    /// Ensure the worker is up and return its status; `Start` is idempotent
    /// so this is safe on every request.
    pub async fn ensure_ready(&self, instance_id: Uuid) -> Result<WorkerStatus, CastorError> {
        self.start(instance_id).await
    }

    pub async fn shutdown(&self) -> Result<(), CastorError> {
        ractor::call!(self.actor, SupervisorMessage::Shutdown)
            .map_err(|e| CastorError::RactorError(format!("Supervisor Shutdown RPC failed: {e}")))
    }

    pub fn reconcile_now(&self) {
        let _ = ractor::cast!(self.actor, SupervisorMessage::RunReconcile);
    }

    /// Subscribe to worker lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

/// Everything a start attempt task needs, bundled for cheap cloning.
#[derive(Clone)]
pub(crate) struct SupervisorDeps {
    pub db: DbActorHandle,
    pub registry: Arc<ServiceRegistry>,
    pub cfg: Arc<SupervisorConfig>,
    pub http: reqwest::Client,
}

struct WorkerEntry {
    port: u16,
    pid: Option<u32>,
    state: WorkerState,
    started_at: DateTime<Utc>,
    retry_count: u32,
    /// Epoch guarding stale task messages after retries or cancellation.
    attempt: u64,
    last_health_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u8,
    commands: Option<mpsc::Sender<ChildCommand>>,
    terminate_reason: Option<TerminateReason>,
    /// Stop arrived before the child existed.
    pending_cancel: bool,
    start_waiters: Vec<RpcReplyPort<Result<WorkerStatus, CastorError>>>,
    stop_waiters: Vec<RpcReplyPort<()>>,
}

impl WorkerEntry {
    fn new(port: u16) -> Self {
        Self {
            port,
            pid: None,
            state: WorkerState::Spawning,
            started_at: Utc::now(),
            retry_count: 0,
            attempt: 0,
            last_health_at: None,
            last_error: None,
            consecutive_failures: 0,
            commands: None,
            terminate_reason: None,
            pending_cancel: false,
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
        }
    }

    fn snapshot(&self, instance_id: Uuid) -> WorkerStatus {
        WorkerStatus {
            instance_id,
            pid: self.pid,
            port: self.port,
            state: self.state,
            started_at: self.started_at,
            retry_count: self.retry_count,
            last_health_at: self.last_health_at,
            last_error: self.last_error.clone(),
        }
    }

    fn send_terminate(&self) {
        if let Some(commands) = &self.commands {
            let commands = commands.clone();
            tokio::spawn(async move {
                let _ = commands.send(ChildCommand::Terminate).await;
            });
        }
    }
}

pub(crate) struct SupervisorActorState {
    deps: SupervisorDeps,
    ports: PortAllocator,
    workers: AHashMap<Uuid, WorkerEntry>,
    events: broadcast::Sender<WorkerEvent>,
    /// Instances that already used their single post-health-failure restart.
    auto_restarted: AHashSet<Uuid>,
    reconcile_inflight: bool,
    shutting_down: bool,
    shutdown_reply: Option<RpcReplyPort<()>>,
    tickers: Vec<JoinHandle<()>>,
}

pub(crate) struct SupervisorActor;

#[ractor::async_trait]
impl Actor for SupervisorActor {
    type Msg = SupervisorMessage;
    type State = SupervisorActorState;
    type Arguments = (SupervisorDeps, broadcast::Sender<WorkerEvent>);

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        (deps, events): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ports = PortAllocator::new(deps.cfg.port_range_low, deps.cfg.port_range_high);

        let mut tickers = Vec::new();
        {
            let myself = myself.clone();
            let period = deps.cfg.health_interval();
            tickers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if myself.cast(SupervisorMessage::RunHealthPass).is_err() {
                        break;
                    }
                }
            }));
        }
        {
            let myself = myself.clone();
            let period = deps.cfg.reconcile_interval();
            tickers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if myself.cast(SupervisorMessage::RunReconcile).is_err() {
                        break;
                    }
                }
            }));
        }

        info!(
            port_range_low = deps.cfg.port_range_low,
            port_range_high = deps.cfg.port_range_high,
            services = deps.registry.len(),
            "Supervisor started"
        );

        Ok(SupervisorActorState {
            deps,
            ports,
            workers: AHashMap::new(),
            events,
            auto_restarted: AHashSet::new(),
            reconcile_inflight: false,
            shutting_down: false,
            shutdown_reply: None,
            tickers,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Start(instance_id, reply) => {
                self.handle_start(&myself, state, instance_id, reply);
            }
            SupervisorMessage::Stop(instance_id, reply) => {
                self.handle_stop(state, instance_id, reply);
            }
            SupervisorMessage::Status(instance_id, reply) => {
                let snapshot = state
                    .workers
                    .get(&instance_id)
                    .map(|e| e.snapshot(instance_id));
                let _ = reply.send(snapshot);
            }
            SupervisorMessage::ListWorkers(reply) => {
                let list = state
                    .workers
                    .iter()
                    .map(|(id, e)| e.snapshot(*id))
                    .collect();
                let _ = reply.send(list);
            }
            SupervisorMessage::Shutdown(reply) => {
                self.handle_shutdown(&myself, state, reply);
            }
            SupervisorMessage::RunHealthPass => {
                self.handle_health_pass(&myself, state);
            }
            SupervisorMessage::RunReconcile => {
                self.handle_run_reconcile(&myself, state);
            }
            SupervisorMessage::StartAttempt(instance_id) => {
                self.handle_start_attempt(&myself, state, instance_id);
            }
            SupervisorMessage::AttemptSpawned {
                instance_id,
                attempt,
                pid,
                commands,
            } => {
                self.handle_attempt_spawned(state, instance_id, attempt, pid, commands);
            }
            SupervisorMessage::AttemptDone {
                instance_id,
                attempt,
                result,
            } => {
                self.handle_attempt_done(&myself, state, instance_id, attempt, result);
            }
            SupervisorMessage::ProcessExited {
                instance_id,
                pid,
                exit_code,
            } => {
                self.handle_process_exited(&myself, state, instance_id, pid, exit_code);
            }
            SupervisorMessage::ProcessError {
                instance_id,
                message,
            } => {
                warn!(%instance_id, "worker process error: {}", message);
                let _ = state.events.send(WorkerEvent::ProcessError {
                    instance_id,
                    message,
                });
            }
            SupervisorMessage::HealthDone {
                instance_id,
                attempt,
                outcome,
                finalizing,
            } => {
                self.handle_health_done(&myself, state, instance_id, attempt, outcome, finalizing);
            }
            SupervisorMessage::DegradeElapsed {
                instance_id,
                attempt,
            } => {
                self.handle_degrade_elapsed(&myself, state, instance_id, attempt);
            }
            SupervisorMessage::ReconcileData { active, stuck } => {
                self.handle_reconcile_data(state, &active, &stuck);
            }
            SupervisorMessage::ShutdownDeadline => {
                if let Some(reply) = state.shutdown_reply.take() {
                    warn!(
                        remaining = state.workers.len(),
                        "shutdown budget exhausted with workers still terminating"
                    );
                    let _ = reply.send(());
                }
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for ticker in state.tickers.drain(..) {
            ticker.abort();
        }
        Ok(())
    }
}

impl SupervisorActor {
    fn handle_start(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        reply: RpcReplyPort<Result<WorkerStatus, CastorError>>,
    ) {
        if state.shutting_down {
            let _ = reply.send(Err(CastorError::UnexpectedError(
                "supervisor is shutting down".to_string(),
            )));
            return;
        }

        if let Some(entry) = state.workers.get_mut(&instance_id) {
            match entry.state {
                WorkerState::Spawning | WorkerState::Probing => {
                    entry.start_waiters.push(reply);
                }
                // Already running (possibly degraded): report the current state.
                WorkerState::Ready | WorkerState::Degraded | WorkerState::Terminating => {
                    let _ = reply.send(Ok(entry.snapshot(instance_id)));
                }
                WorkerState::Dead => {
                    let _ = reply.send(Err(CastorError::WorkerNotRunning));
                }
            }
            return;
        }

        // Fresh start owns the explicit-restart slot again.
        state.auto_restarted.remove(&instance_id);

        let port = match state.ports.acquire() {
            Ok(port) => port,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let mut entry = WorkerEntry::new(port);
        entry.start_waiters.push(reply);
        state.workers.insert(instance_id, entry);
        let _ = myself.cast(SupervisorMessage::StartAttempt(instance_id));
    }

    fn handle_start_attempt(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
    ) {
        let Some(entry) = state.workers.get_mut(&instance_id) else {
            return;
        };
        entry.state = WorkerState::Spawning;
        let attempt = entry.attempt;
        let port = entry.port;
        let deps = state.deps.clone();
        let myself = myself.clone();
        tokio::spawn(async move {
            run_start_attempt(deps, myself, instance_id, port, attempt).await;
        });
    }

    fn handle_attempt_spawned(
        &self,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        attempt: u64,
        pid: u32,
        commands: mpsc::Sender<ChildCommand>,
    ) {
        let Some(entry) = state.workers.get_mut(&instance_id) else {
            // Entry vanished: nothing tracks this child anymore, put it down.
            tokio::spawn(async move {
                let _ = commands.send(ChildCommand::Terminate).await;
            });
            return;
        };
        if entry.attempt != attempt {
            tokio::spawn(async move {
                let _ = commands.send(ChildCommand::Terminate).await;
            });
            return;
        }

        entry.pid = Some(pid);
        entry.commands = Some(commands);

        if entry.pending_cancel || state.shutting_down {
            entry.state = WorkerState::Terminating;
            entry.terminate_reason = Some(if state.shutting_down {
                TerminateReason::Shutdown
            } else {
                TerminateReason::Stop
            });
            entry.send_terminate();
        } else {
            entry.state = WorkerState::Probing;
        }
    }

    fn handle_attempt_done(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        attempt: u64,
        result: Result<(), AttemptError>,
    ) {
        let Some(entry) = state.workers.get_mut(&instance_id) else {
            return;
        };
        if entry.attempt != attempt {
            return;
        }

        match result {
            Ok(()) => {
                if entry.state != WorkerState::Probing {
                    // Stop raced the probe; termination is already underway.
                    return;
                }
                entry.state = WorkerState::Ready;
                entry.last_error = None;
                entry.consecutive_failures = 0;
                entry.last_health_at = Some(Utc::now());
                let snapshot = entry.snapshot(instance_id);
                for waiter in entry.start_waiters.drain(..) {
                    let _ = waiter.send(Ok(snapshot.clone()));
                }
                info!(
                    %instance_id,
                    pid = ?snapshot.pid,
                    port = snapshot.port,
                    "worker is ready"
                );

                let db = state.deps.db.clone();
                let patch = RuntimePatch {
                    status: Some(InstanceStatus::Active),
                    pid: snapshot.pid.map(i64::from),
                    port: Some(i64::from(snapshot.port)),
                    last_error: None,
                    clear_runtime: false,
                };
                tokio::spawn(async move {
                    if let Err(e) = db.patch_runtime(instance_id, patch).await {
                        warn!(%instance_id, "store runtime update failed: {}", e);
                    }
                });
            }
            Err(err) => {
                if entry.state == WorkerState::Terminating && entry.terminate_reason.is_some() {
                    // A stop/shutdown is already settling this worker; its
                    // exit decides the outcome.
                    return;
                }
                if entry.commands.is_some() {
                    // Child is alive; kill it and finish the failure once the
                    // exit is confirmed so the port is never released early.
                    entry.last_error = Some(err.message.clone());
                    entry.state = WorkerState::Terminating;
                    entry.terminate_reason = None; // startup failure, not a stop
                    entry.send_terminate();
                    if err.fatal {
                        entry.retry_count = state.deps.cfg.max_start_retries + 1;
                    }
                } else {
                    self.finalize_attempt_failure(myself, state, instance_id, &err);
                }
            }
        }
    }

    /// Port released, retry-or-fail decided. Only called with no live child.
    fn finalize_attempt_failure(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        err: &AttemptError,
    ) {
        let Some(entry) = state.workers.get_mut(&instance_id) else {
            return;
        };

        if entry.pending_cancel || state.shutting_down {
            self.cleanup_worker(state, instance_id, TerminateReason::Stop, None);
            return;
        }

        entry.retry_count += 1;
        entry.attempt += 1;
        entry.last_error = Some(err.message.clone());
        entry.pid = None;
        entry.commands = None;

        let retries_left = !err.fatal && entry.retry_count <= state.deps.cfg.max_start_retries;
        if retries_left {
            // min(2^k * 1s, 10s) with k starting at 0 for the first retry.
            let exp = entry.retry_count.saturating_sub(1).min(10);
            let delay = Duration::from_secs((1u64 << exp).min(10));
            warn!(
                %instance_id,
                retry = entry.retry_count,
                delay_secs = delay.as_secs(),
                "worker start failed, retrying: {}",
                err.message
            );
            entry.state = WorkerState::Spawning;
            let myself = myself.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = myself.cast(SupervisorMessage::StartAttempt(instance_id));
            });
        } else {
            error!(
                %instance_id,
                retries = entry.retry_count - 1,
                "worker start failed permanently: {}",
                err.message
            );
            let message = err.message.clone();
            for waiter in entry.start_waiters.drain(..) {
                let _ = waiter.send(Err(CastorError::SpawnFailed {
                    reason: message.clone(),
                }));
            }
            let port = entry.port;
            state.ports.release(port);
            state.workers.remove(&instance_id);

            let db = state.deps.db.clone();
            tokio::spawn(async move {
                let patch = RuntimePatch {
                    status: Some(InstanceStatus::Failed),
                    last_error: Some(message),
                    clear_runtime: true,
                    ..Default::default()
                };
                if let Err(e) = db.patch_runtime(instance_id, patch).await {
                    warn!(%instance_id, "store failure update failed: {}", e);
                }
            });
        }
    }

    fn handle_stop(
        &self,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        reply: RpcReplyPort<()>,
    ) {
        state.auto_restarted.remove(&instance_id);

        let Some(entry) = state.workers.get_mut(&instance_id) else {
            // No worker: still record the instance as deliberately stopped.
            let db = state.deps.db.clone();
            tokio::spawn(async move {
                let patch = RuntimePatch {
                    status: Some(InstanceStatus::Inactive),
                    clear_runtime: true,
                    ..Default::default()
                };
                if let Err(e) = db.patch_runtime(instance_id, patch).await {
                    warn!(%instance_id, "store stop update failed: {}", e);
                }
            });
            let _ = reply.send(());
            return;
        };

        entry.stop_waiters.push(reply);
        match entry.state {
            WorkerState::Terminating => {
                // A startup-failure termination would otherwise retry after
                // the exit; the cancel flag routes it to cleanup instead.
                if entry.terminate_reason.is_none() {
                    entry.pending_cancel = true;
                }
            }
            _ if entry.commands.is_some() => {
                entry.state = WorkerState::Terminating;
                entry.terminate_reason = Some(TerminateReason::Stop);
                entry.send_terminate();
            }
            _ => {
                // No child yet: cancel once the in-flight attempt reports in.
                entry.pending_cancel = true;
            }
        }
    }

    fn handle_process_exited(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        pid: u32,
        exit_code: Option<i32>,
    ) {
        let _ = state.events.send(WorkerEvent::ProcessExit {
            instance_id,
            pid,
            exit_code,
        });

        let (worker_state, reason, pending_cancel, last_error) =
            match state.workers.get(&instance_id) {
                Some(entry) if entry.pid == Some(pid) => (
                    entry.state,
                    entry.terminate_reason,
                    entry.pending_cancel,
                    entry.last_error.clone(),
                ),
                Some(_) => {
                    debug!(%instance_id, pid, "exit for stale pid ignored");
                    return;
                }
                None => {
                    debug!(%instance_id, pid, "exit for untracked worker ignored");
                    return;
                }
            };

        match worker_state {
            WorkerState::Terminating => {
                // Startup failures park in Terminating with no reason set and
                // continue through the retry budget once the exit lands.
                if reason.is_none() && !pending_cancel {
                    let message = last_error.unwrap_or_else(|| {
                        format!("worker exited during startup (code {exit_code:?})")
                    });
                    self.park_exit_and_retry(myself, state, instance_id, message);
                    return;
                }

                let reason = reason.unwrap_or(TerminateReason::Stop);
                let restart = matches!(reason, TerminateReason::HealthFailure { restart: true });
                self.cleanup_worker(state, instance_id, reason, exit_code);
                if restart && !state.shutting_down {
                    info!(%instance_id, "attempting single auto-restart after health failure");
                    let myself = myself.clone();
                    // Re-enters through Start to redo eligibility checks.
                    tokio::spawn(async move {
                        let _ = ractor::call!(myself, SupervisorMessage::Start, instance_id);
                    });
                }
            }
            WorkerState::Spawning | WorkerState::Probing => {
                let message = format!("worker exited during startup (code {exit_code:?})");
                self.park_exit_and_retry(myself, state, instance_id, message);
            }
            WorkerState::Ready | WorkerState::Degraded => {
                warn!(%instance_id, pid, ?exit_code, "worker died unexpectedly");
                if let Some(entry) = state.workers.remove(&instance_id) {
                    state.ports.release(entry.port);
                }

                let db = state.deps.db.clone();
                tokio::spawn(async move {
                    let patch = RuntimePatch {
                        status: Some(InstanceStatus::Failed),
                        last_error: Some(format!(
                            "worker process exited unexpectedly (code {exit_code:?})"
                        )),
                        clear_runtime: true,
                        ..Default::default()
                    };
                    if let Err(e) = db.patch_runtime(instance_id, patch).await {
                        warn!(%instance_id, "store failure update failed: {}", e);
                    }
                });
            }
            WorkerState::Dead => {}
        }
        self.finish_shutdown_if_drained(state);
    }

    /// An exit during startup: release the port and go through the retry
    /// budget.
    fn park_exit_and_retry(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        message: String,
    ) {
        let fatal = state
            .workers
            .get(&instance_id)
            .is_some_and(|e| e.retry_count > state.deps.cfg.max_start_retries);
        if let Some(entry) = state.workers.get_mut(&instance_id) {
            entry.pid = None;
            entry.commands = None;
            entry.state = WorkerState::Spawning;
        }
        self.finalize_attempt_failure(
            myself,
            state,
            instance_id,
            &AttemptError { message, fatal },
        );
    }

    /// Remove the record, release the port, settle waiters, and apply the
    /// reason-specific store transition.
    fn cleanup_worker(
        &self,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        reason: TerminateReason,
        exit_code: Option<i32>,
    ) {
        let Some(mut entry) = state.workers.remove(&instance_id) else {
            return;
        };
        state.ports.release(entry.port);

        for waiter in entry.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
        for waiter in entry.start_waiters.drain(..) {
            let _ = waiter.send(Err(CastorError::WorkerNotRunning));
        }

        let patch = match reason {
            TerminateReason::Stop => Some(RuntimePatch {
                status: Some(InstanceStatus::Inactive),
                clear_runtime: true,
                ..Default::default()
            }),
            TerminateReason::HealthFailure { restart: false } => Some(RuntimePatch {
                status: Some(InstanceStatus::Failed),
                last_error: Some(format!(
                    "health checks failed (exit code {exit_code:?})"
                )),
                clear_runtime: true,
                ..Default::default()
            }),
            // The restart path re-provisions immediately; leave the row alone.
            TerminateReason::HealthFailure { restart: true }
            | TerminateReason::Reconcile => None,
            TerminateReason::Shutdown => Some(RuntimePatch {
                clear_runtime: true,
                ..Default::default()
            }),
        };
        if let Some(patch) = patch {
            let db = state.deps.db.clone();
            tokio::spawn(async move {
                if let Err(e) = db.patch_runtime(instance_id, patch).await {
                    warn!(%instance_id, "store cleanup update failed: {}", e);
                }
            });
        }

        self.finish_shutdown_if_drained(state);
    }

    fn finish_shutdown_if_drained(&self, state: &mut SupervisorActorState) {
        if state.shutting_down && state.workers.is_empty() {
            if let Some(reply) = state.shutdown_reply.take() {
                info!("all workers stopped, shutdown complete");
                let _ = reply.send(());
            }
        }
    }

    fn handle_health_pass(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
    ) {
        if state.shutting_down {
            return;
        }
        for (id, entry) in &state.workers {
            if !matches!(entry.state, WorkerState::Ready | WorkerState::Degraded) {
                continue;
            }
            self.spawn_health_probe(myself, state, *id, entry, false);
        }
    }

    fn spawn_health_probe(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &SupervisorActorState,
        instance_id: Uuid,
        entry: &WorkerEntry,
        finalizing: bool,
    ) {
        let port = entry.port;
        let attempt = entry.attempt;
        let http = state.deps.http.clone();
        let timeout = state.deps.cfg.probe_timeout();
        let registry = state.deps.registry.clone();
        let db = state.deps.db.clone();
        let myself = myself.clone();
        tokio::spawn(async move {
            // Service name comes from the store row; the worker record keeps
            // no copy of it.
            let service = match db.lookup_instance(instance_id).await {
                Ok(Some(row)) => row.service_name,
                _ => String::new(),
            };
            let outcome = if registry.get(&service).is_some() {
                health_pass(&http, port, instance_id, &service, timeout).await
            } else {
                Err("service missing from registry".to_string())
            };
            let _ = myself.cast(SupervisorMessage::HealthDone {
                instance_id,
                attempt,
                outcome,
                finalizing,
            });
        });
    }

    fn handle_health_done(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        attempt: u64,
        outcome: Result<(), String>,
        finalizing: bool,
    ) {
        let Some(entry) = state.workers.get_mut(&instance_id) else {
            return;
        };
        if entry.attempt != attempt
            || !matches!(entry.state, WorkerState::Ready | WorkerState::Degraded)
        {
            return;
        }

        match outcome {
            Ok(()) => {
                if entry.state == WorkerState::Degraded {
                    info!(%instance_id, "worker recovered from degraded state");
                }
                entry.state = WorkerState::Ready;
                entry.consecutive_failures = 0;
                entry.last_health_at = Some(Utc::now());
            }
            Err(detail) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                let _ = state.events.send(WorkerEvent::HealthCheckFailed {
                    instance_id,
                    detail: detail.clone(),
                });

                if finalizing {
                    self.fail_degraded_worker(state, instance_id, &detail);
                    return;
                }

                if entry.consecutive_failures >= DEGRADE_THRESHOLD
                    && entry.state == WorkerState::Ready
                {
                    warn!(%instance_id, "worker degraded: {}", detail);
                    entry.state = WorkerState::Degraded;
                    entry.last_error = Some(detail);
                    let myself = myself.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(DEGRADE_GRACE).await;
                        let _ = myself.cast(SupervisorMessage::DegradeElapsed {
                            instance_id,
                            attempt,
                        });
                    });
                }
            }
        }
    }

    fn handle_degrade_elapsed(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        attempt: u64,
    ) {
        let Some(entry) = state.workers.get(&instance_id) else {
            return;
        };
        if entry.attempt != attempt || entry.state != WorkerState::Degraded {
            return;
        }
        // One recheck decides between recovery and failure.
        self.spawn_health_probe(myself, state, instance_id, entry, true);
    }

    fn fail_degraded_worker(
        &self,
        state: &mut SupervisorActorState,
        instance_id: Uuid,
        detail: &str,
    ) {
        let allow_restart = !state.auto_restarted.contains(&instance_id);
        if allow_restart {
            state.auto_restarted.insert(instance_id);
        }
        error!(
            %instance_id,
            restart = allow_restart,
            "worker failed health checks beyond the grace period: {}",
            detail
        );
        if let Some(entry) = state.workers.get_mut(&instance_id) {
            entry.state = WorkerState::Terminating;
            entry.terminate_reason = Some(TerminateReason::HealthFailure {
                restart: allow_restart,
            });
            entry.last_error = Some(detail.to_string());
            entry.send_terminate();
        }
    }

    fn handle_run_reconcile(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
    ) {
        // Skip-if-busy: never stack reconcile passes on top of each other.
        if state.reconcile_inflight || state.shutting_down {
            return;
        }
        state.reconcile_inflight = true;

        let db = state.deps.db.clone();
        let myself = myself.clone();
        tokio::spawn(async move {
            let cutoff = Utc::now() - chrono::Duration::minutes(2);
            let active = db.list_active_instances().await.unwrap_or_else(|e| {
                warn!("reconcile: active instance scan failed: {}", e);
                Vec::new()
            });
            let stuck = db.list_stuck_provisioning(cutoff).await.unwrap_or_else(|e| {
                warn!("reconcile: stuck provisioning scan failed: {}", e);
                Vec::new()
            });
            let _ = myself.cast(SupervisorMessage::ReconcileData { active, stuck });
        });
    }

    fn handle_reconcile_data(
        &self,
        state: &mut SupervisorActorState,
        active: &[DbInstance],
        stuck: &[Uuid],
    ) {
        state.reconcile_inflight = false;
        if state.shutting_down {
            return;
        }

        let active_ids: AHashSet<Uuid> = active.iter().map(|i| i.id).collect();

        // Store says active, nothing supervised: orphaned row.
        for row in active {
            if state.workers.contains_key(&row.id) {
                continue;
            }
            warn!(instance_id = %row.id, "active row has no live worker, marking orphaned");
            let db = state.deps.db.clone();
            let instance_id = row.id;
            tokio::spawn(async move {
                let patch = RuntimePatch {
                    status: Some(InstanceStatus::Failed),
                    last_error: Some("orphaned".to_string()),
                    clear_runtime: true,
                    ..Default::default()
                };
                if let Err(e) = db.patch_runtime(instance_id, patch).await {
                    warn!(%instance_id, "orphan repair failed: {}", e);
                }
            });
        }

        // Supervised worker, no active store row: terminate it. In-flight
        // starts and stops are skipped; they settle on their own.
        let rogue: Vec<Uuid> = state
            .workers
            .iter()
            .filter(|(id, entry)| {
                matches!(entry.state, WorkerState::Ready | WorkerState::Degraded)
                    && !active_ids.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        for instance_id in rogue {
            warn!(%instance_id, "worker has no active store row, terminating");
            if let Some(entry) = state.workers.get_mut(&instance_id) {
                entry.state = WorkerState::Terminating;
                entry.terminate_reason = Some(TerminateReason::Reconcile);
                entry.send_terminate();
            }
        }

        // Rows stuck in provisioning with no one working on them.
        for &instance_id in stuck {
            if state.workers.contains_key(&instance_id) {
                continue;
            }
            warn!(%instance_id, "instance stuck in provisioning, marking failed");
            let db = state.deps.db.clone();
            tokio::spawn(async move {
                let patch = RuntimePatch {
                    status: Some(InstanceStatus::Failed),
                    last_error: Some("provisioning timed out".to_string()),
                    clear_runtime: true,
                    ..Default::default()
                };
                if let Err(e) = db.patch_runtime(instance_id, patch).await {
                    warn!(%instance_id, "stuck-provisioning repair failed: {}", e);
                }
            });
        }
    }

    fn handle_shutdown(
        &self,
        myself: &ActorRef<SupervisorMessage>,
        state: &mut SupervisorActorState,
        reply: RpcReplyPort<()>,
    ) {
        if state.shutting_down {
            let _ = reply.send(());
            return;
        }
        state.shutting_down = true;
        for ticker in state.tickers.drain(..) {
            ticker.abort();
        }

        if state.workers.is_empty() {
            let _ = reply.send(());
            return;
        }

        info!(workers = state.workers.len(), "stopping all workers");
        state.shutdown_reply = Some(reply);
        for entry in state.workers.values_mut() {
            if entry.commands.is_some() {
                entry.state = WorkerState::Terminating;
                entry.terminate_reason = Some(TerminateReason::Shutdown);
                entry.send_terminate();
            } else {
                entry.pending_cancel = true;
            }
        }

        let deadline = state.deps.cfg.shutdown_timeout();
        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = myself.cast(SupervisorMessage::ShutdownDeadline);
        });
    }
}

/// Eligibility, spawn, and probe for one start attempt. Reports back to the
/// actor by message; never touches actor state directly.
async fn run_start_attempt(
    deps: SupervisorDeps,
    myself: ActorRef<SupervisorMessage>,
    instance_id: Uuid,
    port: u16,
    attempt: u64,
) {
    let done = |result: Result<(), AttemptError>| SupervisorMessage::AttemptDone {
        instance_id,
        attempt,
        result,
    };

    let instance = match deps.db.lookup_instance(instance_id).await {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            let _ = myself.cast(done(Err(AttemptError {
                message: "instance not found".to_string(),
                fatal: true,
            })));
            return;
        }
        Err(e) => {
            let _ = myself.cast(done(Err(AttemptError {
                message: format!("store lookup failed: {e}"),
                fatal: false,
            })));
            return;
        }
    };

    if let Err(message) = check_eligibility(&deps, &instance).await {
        let _ = myself.cast(done(Err(AttemptError {
            message,
            fatal: true,
        })));
        return;
    }

    let Some(spec) = deps.registry.get_enabled(&instance.service_name) else {
        let _ = myself.cast(done(Err(AttemptError {
            message: format!("service {} is unknown or disabled", instance.service_name),
            fatal: true,
        })));
        return;
    };

    // Mark the row provisioning for the duration of the start.
    let provisioning = RuntimePatch {
        status: Some(InstanceStatus::Provisioning),
        ..Default::default()
    };
    if let Err(e) = deps.db.patch_runtime(instance_id, provisioning).await {
        warn!(%instance_id, "provisioning status update failed: {}", e);
    }

    let spawned = match spawn_worker(
        &spec,
        &instance,
        port,
        &deps.cfg.log_root,
        deps.cfg.terminate_grace(),
        myself.clone(),
    )
    .await
    {
        Ok(spawned) => spawned,
        Err(e) => {
            let _ = myself.cast(done(Err(AttemptError {
                message: e.to_string(),
                fatal: false,
            })));
            return;
        }
    };

    let _ = myself.cast(SupervisorMessage::AttemptSpawned {
        instance_id,
        attempt,
        pid: spawned.pid,
        commands: spawned.commands,
    });

    let result = wait_until_ready(
        &deps.http,
        port,
        instance_id,
        &instance.service_name,
        deps.cfg.startup_timeout(),
        deps.cfg.probe_timeout(),
    )
    .await
    .map_err(|e| AttemptError {
        message: e.to_string(),
        fatal: false,
    });
    let _ = myself.cast(done(result));
}

/// Revoked/expired instances and plan overruns never start.
async fn check_eligibility(deps: &SupervisorDeps, instance: &DbInstance) -> Result<(), String> {
    if instance.status == InstanceStatus::Revoked {
        return Err("instance is revoked".to_string());
    }
    if let Some(expires_at) = instance.expires_at {
        if expires_at <= Utc::now() {
            return Err("instance has expired".to_string());
        }
    }

    let plan_type = match deps.db.get_user_plan(instance.user_id).await {
        Ok(Some(plan)) => plan.plan_type,
        Ok(None) => PlanType::Free,
        Err(e) => return Err(format!("plan lookup failed: {e}")),
    };
    let active = deps
        .db
        .count_active_instances(instance.user_id)
        .await
        .map_err(|e| format!("instance count failed: {e}"))?;

    let quota = plan_type.max_instances();
    let would_be_active = if instance.status == InstanceStatus::Active {
        active
    } else {
        active + 1
    };
    if would_be_active > quota {
        return Err(format!(
            "plan quota exceeded ({would_be_active} active of {quota} allowed)"
        ));
    }
    Ok(())
}

/// Async spawn of the supervisor actor and return a handle.
pub async fn spawn(
    db: DbActorHandle,
    registry: Arc<ServiceRegistry>,
    cfg: Arc<SupervisorConfig>,
) -> SupervisorHandle {
    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(2))
        .timeout(cfg.probe_timeout())
        .build()
        .expect("failed to build supervisor HTTP client");

    let (events, _) = broadcast::channel(256);
    let deps = SupervisorDeps {
        db,
        registry,
        cfg,
        http,
    };

    let (actor, _jh) = Actor::spawn(
        Some("CastorSupervisor".to_string()),
        SupervisorActor,
        (deps, events.clone()),
    )
    .await
    .expect("failed to spawn SupervisorActor");
    SupervisorHandle { actor, events }
}
