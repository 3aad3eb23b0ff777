use ractor::ActorRef;
use serde_json::json;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{Sleep, sleep};
use tracing::{debug, warn};

use super::actor::SupervisorMessage;
use super::logs::LogSinks;
use crate::db::{CredentialKind, DbInstance};
use crate::error::CastorError;
use crate::registry::ServiceSpec;

/// Commands the supervisor sends to a child's exit watcher.
#[derive(Debug)]
pub enum ChildCommand {
    /// SIGTERM now, SIGKILL after the grace period.
    Terminate,
}

/// Handle to a spawned worker process.
pub struct SpawnedWorker {
    pub pid: u32,
    pub commands: mpsc::Sender<ChildCommand>,
}

/// Spawn the worker binary for an instance with its identity, port, and
/// credentials in the environment, stdio piped into the per-instance log
/// sinks, and an exit watcher reporting back to the supervisor.
pub async fn spawn_worker(
    spec: &ServiceSpec,
    instance: &DbInstance,
    port: u16,
    log_root: &Path,
    terminate_grace: Duration,
    supervisor: ActorRef<SupervisorMessage>,
) -> Result<SpawnedWorker, CastorError> {
    let credentials_json = credentials_json(instance);
    let config_json = json!({
        "service": spec.name,
        "metadata": spec.metadata,
    });

    let sinks = Arc::new(LogSinks::open(log_root, instance.user_id, instance.id).await?);

    let mut child = Command::new(&spec.binary)
        .args(&spec.args)
        .env("PORT", port.to_string())
        .env("INSTANCE_ID", instance.id.to_string())
        .env("USER_ID", instance.user_id.to_string())
        .env("SERVICE_NAME", &spec.name)
        .env("CREDENTIALS_JSON", credentials_json.to_string())
        .env("CONFIG_JSON", config_json.to_string())
        .env("ENV", "production")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CastorError::SpawnFailed {
            reason: format!("{}: {e}", spec.binary),
        })?;

    let pid = child.id().ok_or_else(|| CastorError::SpawnFailed {
        reason: "child exited before a pid was observed".to_string(),
    })?;

    if let Some(stdout) = child.stdout.take() {
        let sinks = sinks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sinks.write_stdout(&line).await;
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let sinks = sinks.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sinks.write_stderr(&line).await;
            }
        });
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<ChildCommand>(4);
    let instance_id = instance.id;
    tokio::spawn(watch_child(
        child,
        cmd_rx,
        sinks,
        instance_id,
        pid,
        terminate_grace,
        supervisor,
    ));

    debug!(%instance_id, pid, port, service = %spec.name, "worker spawned");
    Ok(SpawnedWorker {
        pid,
        commands: cmd_tx,
    })
}

fn credentials_json(instance: &DbInstance) -> serde_json::Value {
    match instance.kind {
        CredentialKind::ApiKey => json!({
            "kind": "api_key",
            "api_key": instance.access_token,
            "blob": instance.encrypted_credential_blob,
        }),
        CredentialKind::Oauth => json!({
            "kind": "oauth",
            "access_token": instance.access_token,
            "refresh_token": instance.refresh_token,
            "token_expires_at": instance.token_expires_at,
        }),
    }
}

/// Owns the `Child`: waits for exit, handles graceful termination, and
/// reports the outcome to the supervisor. The port is only released once
/// this task has observed the exit.
async fn watch_child(
    mut child: tokio::process::Child,
    mut commands: mpsc::Receiver<ChildCommand>,
    sinks: Arc<LogSinks>,
    instance_id: uuid::Uuid,
    pid: u32,
    terminate_grace: Duration,
    supervisor: ActorRef<SupervisorMessage>,
) {
    let mut grace: Option<Pin<Box<Sleep>>> = None;
    let mut commands_open = true;

    loop {
        tokio::select! {
            status = child.wait() => {
                sinks.close().await;
                match status {
                    Ok(status) => {
                        let _ = supervisor.cast(SupervisorMessage::ProcessExited {
                            instance_id,
                            pid,
                            exit_code: status.code(),
                        });
                    }
                    Err(e) => {
                        let _ = supervisor.cast(SupervisorMessage::ProcessError {
                            instance_id,
                            message: format!("wait on worker failed: {e}"),
                        });
                        let _ = supervisor.cast(SupervisorMessage::ProcessExited {
                            instance_id,
                            pid,
                            exit_code: None,
                        });
                    }
                }
                break;
            }

            cmd = commands.recv(), if commands_open && grace.is_none() => {
                match cmd {
                    Some(ChildCommand::Terminate) => {
                        send_sigterm(pid);
                        grace = Some(Box::pin(sleep(terminate_grace)));
                    }
                    None => commands_open = false,
                }
            }

            () = async {
                match grace.as_mut() {
                    Some(deadline) => deadline.await,
                    None => std::future::pending().await,
                }
            } => {
                warn!(%instance_id, pid, "worker ignored SIGTERM, escalating to SIGKILL");
                if let Err(e) = child.start_kill() {
                    warn!(%instance_id, pid, "SIGKILL failed: {}", e);
                }
                grace = None;
            }
        }
    }
}

fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, "SIGTERM failed: {}", e);
    }
}
