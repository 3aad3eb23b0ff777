use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;
use uuid::Uuid;

use crate::error::CastorError;

/// Delay before the first probe; workers never bind instantly.
const INITIAL_GRACE: Duration = Duration::from_secs(1);

/// Cadence between probe attempts inside the startup budget.
const PROBE_CADENCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    PortBound,
    Health,
    Protocol,
}

/// Drive a freshly spawned worker to `ready`: port LISTEN, then HTTP health,
/// then the protocol smoke (`info` + non-empty `tools`). Each stage retries
/// on the 1 s cadence until the overall startup budget is exhausted.
pub async fn wait_until_ready(
    client: &reqwest::Client,
    port: u16,
    instance_id: Uuid,
    service: &str,
    startup_budget: Duration,
    probe_timeout: Duration,
) -> Result<(), CastorError> {
    let deadline = Instant::now() + startup_budget;
    sleep(INITIAL_GRACE).await;

    let mut stage = Stage::PortBound;
    loop {
        let outcome = match stage {
            Stage::PortBound => probe_port(port).await,
            Stage::Health => probe_health(client, port, probe_timeout).await,
            Stage::Protocol => {
                probe_protocol(client, port, instance_id, service, probe_timeout).await
            }
        };

        match outcome {
            Ok(()) => {
                debug!(%instance_id, port, ?stage, "probe stage passed");
                stage = match stage {
                    Stage::PortBound => Stage::Health,
                    Stage::Health => Stage::Protocol,
                    Stage::Protocol => return Ok(()),
                };
            }
            Err(err) => {
                if Instant::now() + PROBE_CADENCE > deadline {
                    return Err(match err {
                        e @ CastorError::ProtocolProbeFailed(_) => e,
                        _ => CastorError::StartupTimeout,
                    });
                }
                sleep(PROBE_CADENCE).await;
            }
        }
    }
}

/// One health pass as used by the monitor: health probe plus protocol smoke.
/// Returns the failure detail instead of an error type so callers can count
/// and publish it.
pub async fn health_pass(
    client: &reqwest::Client,
    port: u16,
    instance_id: Uuid,
    service: &str,
    probe_timeout: Duration,
) -> Result<(), String> {
    probe_health(client, port, probe_timeout)
        .await
        .map_err(|e| format!("health probe: {e}"))?;
    probe_protocol(client, port, instance_id, service, probe_timeout)
        .await
        .map_err(|e| format!("protocol probe: {e}"))?;
    Ok(())
}

async fn probe_port(port: u16) -> Result<(), CastorError> {
    let connect = TcpStream::connect(("127.0.0.1", port));
    match timeout(Duration::from_secs(1), connect).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(CastorError::IoError(e)),
        Err(_) => Err(CastorError::StartupTimeout),
    }
}

async fn probe_health(
    client: &reqwest::Client,
    port: u16,
    probe_timeout: Duration,
) -> Result<(), CastorError> {
    let url = format!("http://127.0.0.1:{port}/health");
    let resp = client.get(&url).timeout(probe_timeout).send().await?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(CastorError::UpstreamStatus(resp.status()))
    }
}

async fn probe_protocol(
    client: &reqwest::Client,
    port: u16,
    instance_id: Uuid,
    service: &str,
    probe_timeout: Duration,
) -> Result<(), CastorError> {
    let base = format!("http://127.0.0.1:{port}/{instance_id}/mcp/{service}");

    let info = client
        .get(format!("{base}/info"))
        .timeout(probe_timeout)
        .send()
        .await?;
    if !info.status().is_success() {
        return Err(CastorError::ProtocolProbeFailed(format!(
            "info returned {}",
            info.status()
        )));
    }

    let tools = client
        .get(format!("{base}/tools"))
        .timeout(probe_timeout)
        .send()
        .await?;
    if !tools.status().is_success() {
        return Err(CastorError::ProtocolProbeFailed(format!(
            "tools returned {}",
            tools.status()
        )));
    }
    let body: Value = tools.json().await?;
    if tools_list_ok(&body) {
        Ok(())
    } else {
        Err(CastorError::ProtocolProbeFailed(
            "tools list is missing or empty".to_string(),
        ))
    }
}

/// A well-formed tool list is a non-empty `tools` array.
fn tools_list_ok(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tools_list_validation() {
        assert!(tools_list_ok(&json!({ "tools": [{ "name": "search" }] })));
        assert!(!tools_list_ok(&json!({ "tools": [] })));
        assert!(!tools_list_ok(&json!({ "tools": "nope" })));
        assert!(!tools_list_ok(&json!({})));
    }
}
