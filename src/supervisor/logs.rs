use chrono::Utc;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CastorError;

/// The three per-worker streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    App,
    Access,
    Error,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::App => "app",
            LogStream::Access => "access",
            LogStream::Error => "error",
        }
    }

    fn level(self) -> &'static str {
        match self {
            LogStream::Error => "error",
            _ => "info",
        }
    }
}

/// Classify one stdout line: anything carrying an HTTP method token is
/// access-log traffic, the rest is application output.
pub fn route_stdout(line: &str) -> LogStream {
    const METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];
    let has_method = line
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|tok| METHODS.contains(&tok));
    if has_method {
        LogStream::Access
    } else {
        LogStream::App
    }
}

/// Deterministic path layout:
/// `<root>/users/user_<user_id>/mcp_<instance_id>/{app,access,error}.log`.
pub fn instance_log_dir(root: &Path, user_id: Uuid, instance_id: Uuid) -> PathBuf {
    root.join("users")
        .join(format!("user_{user_id}"))
        .join(format!("mcp_{instance_id}"))
}

/// Append-only JSON-line sinks for one worker. One writer task per child
/// stream; the per-stream mutex serializes any stragglers.
pub struct LogSinks {
    instance_id: Uuid,
    app: Mutex<File>,
    access: Mutex<File>,
    error: Mutex<File>,
}

impl LogSinks {
    /// Open (creating directories as needed) the three streams for a worker.
    pub async fn open(
        root: &Path,
        user_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Self, CastorError> {
        let dir = instance_log_dir(root, user_id, instance_id);
        tokio::fs::create_dir_all(&dir).await?;

        Ok(Self {
            instance_id,
            app: Mutex::new(open_append(&dir.join("app.log")).await?),
            access: Mutex::new(open_append(&dir.join("access.log")).await?),
            error: Mutex::new(open_append(&dir.join("error.log")).await?),
        })
    }

    /// Append one structured record to the given stream.
    pub async fn write(&self, stream: LogStream, message: &str, metadata: Value) {
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "level": stream.level(),
            "message": message,
            "stream": stream.as_str(),
            "instance_id": self.instance_id,
            "metadata": metadata,
        });
        let mut line = record.to_string();
        line.push('\n');

        let file = match stream {
            LogStream::App => &self.app,
            LogStream::Access => &self.access,
            LogStream::Error => &self.error,
        };
        let mut guard = file.lock().await;
        if let Err(e) = guard.write_all(line.as_bytes()).await {
            tracing::warn!(
                instance_id = %self.instance_id,
                stream = stream.as_str(),
                "worker log write failed: {}",
                e
            );
        }
    }

    /// Route one stdout line to access or app and append it.
    pub async fn write_stdout(&self, line: &str) {
        self.write(route_stdout(line), line, json!({})).await;
    }

    /// Stderr always lands in the error stream.
    pub async fn write_stderr(&self, line: &str) {
        self.write(LogStream::Error, line, json!({})).await;
    }

    /// Flush all three streams; called on worker exit before drop.
    pub async fn close(&self) {
        for file in [&self.app, &self.access, &self.error] {
            let mut guard = file.lock().await;
            let _ = guard.flush().await;
        }
    }
}

async fn open_append(path: &Path) -> Result<File, CastorError> {
    Ok(OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_routing_detects_http_methods() {
        assert_eq!(route_stdout("GET /health 200 3ms"), LogStream::Access);
        assert_eq!(
            route_stdout("127.0.0.1 - POST /abc/mcp/github/rpc 200"),
            LogStream::Access
        );
        assert_eq!(route_stdout("server listening on 49207"), LogStream::App);
        // Method token must stand alone; substrings don't count.
        assert_eq!(route_stdout("BUDGET exceeded"), LogStream::App);
        assert_eq!(route_stdout("WIDGETS loaded"), LogStream::App);
    }

    #[test]
    fn log_dir_layout_is_deterministic() {
        let user = Uuid::nil();
        let instance = Uuid::nil();
        let dir = instance_log_dir(Path::new("logs"), user, instance);
        assert_eq!(
            dir,
            PathBuf::from(format!("logs/users/user_{user}/mcp_{instance}"))
        );
    }

    #[tokio::test]
    async fn records_are_json_lines_in_the_right_files() {
        let tmp = std::env::temp_dir().join(format!("castor_logs_{}", Uuid::new_v4()));
        let user = Uuid::new_v4();
        let instance = Uuid::new_v4();
        let sinks = LogSinks::open(&tmp, user, instance).await.unwrap();

        sinks.write_stdout("GET /health 200").await;
        sinks.write_stdout("worker booted").await;
        sinks.write_stderr("something broke").await;
        sinks.close().await;

        let dir = instance_log_dir(&tmp, user, instance);
        let access = tokio::fs::read_to_string(dir.join("access.log")).await.unwrap();
        let app = tokio::fs::read_to_string(dir.join("app.log")).await.unwrap();
        let error = tokio::fs::read_to_string(dir.join("error.log")).await.unwrap();

        let access_rec: Value = serde_json::from_str(access.lines().next().unwrap()).unwrap();
        assert_eq!(access_rec["stream"], "access");
        assert_eq!(access_rec["message"], "GET /health 200");
        assert_eq!(access_rec["instance_id"], json!(instance));

        let app_rec: Value = serde_json::from_str(app.lines().next().unwrap()).unwrap();
        assert_eq!(app_rec["stream"], "app");

        let err_rec: Value = serde_json::from_str(error.lines().next().unwrap()).unwrap();
        assert_eq!(err_rec["level"], "error");

        tokio::fs::remove_dir_all(&tmp).await.unwrap();
    }
}
