//! Worker processes and the stdout protocol they speak.
//!
//! A worker reports back by printing tags on stdout:
//! - `<commit ref="abc123">message</commit>`: record a commit
//! - `<message to="worker-2">payload</message>`: send a bus message
//! - `<heartbeat/>`: liveness only
//!
//! Any other line is plain output and also counts as a heartbeat.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::work::WorkUnit;
use crate::worktree::ExecutionContext;

/// Bytes of stderr kept for the failure reason.
const STDERR_TAIL: usize = 2048;

/// Something a running worker reported.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Commit { reference: String, message: String },
    Message { to: String, payload: serde_json::Value },
    Heartbeat,
    Output(String),
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerExit {
    Succeeded,
    Failed { code: Option<i32>, reason: String },
    /// Stopped by cancellation or revocation.
    Killed,
}

/// Everything a runner needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub identity: String,
    pub unit: WorkUnit,
    pub context: ExecutionContext,
}

/// Executes the task for one unit inside its context.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(
        &self,
        spec: WorkerSpec,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Result<WorkerExit>;
}

/// Parse one stdout line into an event.
pub fn parse_line(line: &str) -> WorkerEvent {
    let trimmed = line.trim();
    if trimmed == "<heartbeat/>" || trimmed == "<heartbeat />" {
        return WorkerEvent::Heartbeat;
    }
    if let Some((reference, body)) = parse_tag(trimmed, "commit", "ref") {
        return WorkerEvent::Commit {
            reference,
            message: body.trim().to_string(),
        };
    }
    if let Some((to, body)) = parse_tag(trimmed, "message", "to") {
        // JSON bodies stay structured; anything else travels as a string.
        let payload = serde_json::from_str(body.trim())
            .unwrap_or_else(|_| serde_json::Value::String(body.trim().to_string()));
        return WorkerEvent::Message { to, payload };
    }
    WorkerEvent::Output(line.to_string())
}

/// Match `<tag attr="value">body</tag>` and return `(value, body)`.
fn parse_tag<'a>(line: &'a str, tag: &str, attr: &str) -> Option<(String, &'a str)> {
    let open = format!("<{} {}=\"", tag, attr);
    let close = format!("</{}>", tag);
    let start = line.find(&open)? + open.len();
    let rest = &line[start..];
    let quote = rest.find('"')?;
    let value = &rest[..quote];
    let after = rest[quote + 1..].strip_prefix('>')?;
    let end = after.find(&close)?;
    if value.is_empty() {
        return None;
    }
    Some((value.to_string(), &after[..end]))
}

enum Stop {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut,
}

/// Runs a shell command per unit, in the context directory.
pub struct ProcessRunner {
    command: String,
    timeout: Option<Duration>,
    env: HashMap<String, String>,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            env: HashMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl WorkerRunner for ProcessRunner {
    async fn run(
        &self,
        spec: WorkerSpec,
        events: mpsc::Sender<WorkerEvent>,
        cancel: CancellationToken,
    ) -> Result<WorkerExit> {
        let input = serde_json::to_vec(&spec.unit).context("Failed to encode work unit")?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&spec.context.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("TANDEM_WORK_ID", &spec.unit.id)
            .env("TANDEM_WORKER_ID", &spec.identity)
            .env("TANDEM_CONTEXT_ID", &spec.context.id)
            .env("TANDEM_CONTEXT_PATH", &spec.context.path)
            .env("TANDEM_PRIORITY_NUMBER", spec.unit.priority_number.to_string())
            .env("TANDEM_ATTEMPT", spec.unit.attempts.to_string())
            .envs(&self.env);
        if let Some(group) = &spec.unit.related_works_id {
            cmd.env("TANDEM_GROUP", group);
        }
        if let Some(branch) = &spec.context.branch {
            cmd.env("TANDEM_BRANCH", branch);
        }

        let mut child = cmd.spawn().context("Failed to spawn worker process")?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(&input).await {
                debug!(work_id = %spec.unit.id, error = %e, "Worker closed stdin early");
            }
        }

        let stdout = child.stdout.take().context("Worker stdout not captured")?;
        let mut stderr = child.stderr.take().context("Worker stderr not captured")?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let work_id = spec.unit.id.clone();
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if reader_events.send(parse_line(&line)).await.is_err() {
                    break;
                }
            }
        });

        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status.context("Failed to wait for worker")?),
            _ = cancel.cancelled() => Stop::Cancelled,
            _ = deadline => Stop::TimedOut,
        };

        let status = match stop {
            Stop::Exited(status) => status,
            Stop::Cancelled => {
                if let Err(e) = child.kill().await {
                    warn!(work_id = %work_id, error = %e, "Failed to kill cancelled worker");
                }
                reader.abort();
                return Ok(WorkerExit::Killed);
            }
            Stop::TimedOut => {
                warn!(work_id = %work_id, "Worker timed out; killing");
                if let Err(e) = child.kill().await {
                    warn!(work_id = %work_id, error = %e, "Failed to kill timed out worker");
                }
                reader.abort();
                return Ok(WorkerExit::Failed {
                    code: None,
                    reason: format!("timed out after {:?}", self.timeout.unwrap_or_default()),
                });
            }
        };

        // Drain the remaining stdout so trailing tags are not lost.
        let _ = reader.await;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(WorkerExit::Succeeded)
        } else {
            let text = String::from_utf8_lossy(&stderr);
            let tail_start = text.len().saturating_sub(STDERR_TAIL);
            let tail = text
                .get(tail_start..)
                .unwrap_or(&text)
                .trim()
                .to_string();
            let reason = if tail.is_empty() {
                format!("worker exited with {}", status)
            } else {
                tail
            };
            Ok(WorkerExit::Failed {
                code: status.code(),
                reason,
            })
        }
    }
}
