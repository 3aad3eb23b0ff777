//! Worker supervision: port allocation, spawning, readiness probing, health
//! monitoring, and store reconciliation, coordinated by one actor that owns
//! the worker-record table. Long-running work (spawn, probe, terminate) runs
//! in tasks that report back by message; the mailbox is the per-instance
//! serialization point.

pub mod actor;
pub mod logs;
pub mod ports;
pub mod probe;
pub mod record;
pub mod spawner;

pub use actor::{SupervisorHandle, SupervisorMessage, spawn};
pub use logs::{LogSinks, LogStream, instance_log_dir, route_stdout};
pub use ports::PortAllocator;
pub use record::{WorkerEvent, WorkerState, WorkerStatus};
