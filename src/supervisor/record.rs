use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Spawning,
    Probing,
    Ready,
    Degraded,
    Terminating,
    Dead,
}

/// Immutable snapshot of a worker record, as returned by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub instance_id: Uuid,
    pub pid: Option<u32>,
    pub port: u16,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_health_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Events published for downstream reaction (reconciler, operators, tests).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    ProcessExit {
        instance_id: Uuid,
        pid: u32,
        exit_code: Option<i32>,
    },
    ProcessError {
        instance_id: Uuid,
        message: String,
    },
    HealthCheckFailed {
        instance_id: Uuid,
        detail: String,
    },
}
