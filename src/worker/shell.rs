//! Shell executor — runs a configured command once per task.
//!
//! The task is passed in `CODEFLEET_TASK_*` environment variables. The
//! command talks back through stdout lines:
//!
//! ```text
//! codefleet:file:<created|modified|deleted>:<path>
//! codefleet:usage:<tokens>:<cost_usd>
//! ```
//!
//! Every other stdout line is output; the last lines become the summary.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ExecutionError;
use crate::fleet::model::{ChangeType, Task, TaskResult};
use crate::worker::executor::{Executor, ProgressReporter};

/// Output lines kept for the summary.
const SUMMARY_LINES: usize = 20;

/// Maximum stderr kept for the error message.
const MAX_STDERR: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    File(ChangeType, String),
    Usage(u64, Decimal),
}

fn parse_directive(line: &str) -> Option<Directive> {
    let rest = line.trim_end().strip_prefix("codefleet:")?;
    if let Some(file) = rest.strip_prefix("file:") {
        let (kind, path) = file.split_once(':')?;
        let change = ChangeType::from_str(kind).ok()?;
        if path.is_empty() {
            return None;
        }
        return Some(Directive::File(change, path.to_string()));
    }
    if let Some(usage) = rest.strip_prefix("usage:") {
        let (tokens, cost) = usage.split_once(':')?;
        return Some(Directive::Usage(
            tokens.parse().ok()?,
            Decimal::from_str(cost).ok()?,
        ));
    }
    None
}

/// Runs `sh -c <command>` in a working directory.
pub struct ShellExecutor {
    command: String,
    workdir: PathBuf,
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
            timeout: None,
        }
    }

    /// Kill the command if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command_for(&self, task: &Task) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.workdir)
            .env("CODEFLEET_TASK_ID", task.id.to_string())
            .env("CODEFLEET_TASK_TITLE", &task.title)
            .env("CODEFLEET_TASK_DESCRIPTION", &task.description)
            .env("CODEFLEET_TASK_PRIORITY", task.priority.to_string())
            .env(
                "CODEFLEET_TASK_FILE_SCOPE",
                task.file_scope.iter().cloned().collect::<Vec<_>>().join(","),
            )
            .env("CODEFLEET_TASK_LABELS", task.labels.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the execution future (cancel, shutdown) kills the child.
            .kill_on_drop(true);
        command
    }

    async fn run(
        &self,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<TaskResult, ExecutionError> {
        let started = Instant::now();
        let mut child = self
            .command_for(task)
            .spawn()
            .map_err(|e| ExecutionError::Spawn(format!("{}: {e}", self.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::Spawn("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::Spawn("stderr not captured".into()))?;

        let read_stderr = async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        };

        let read_stdout = async {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(SUMMARY_LINES);
            let mut usage = (0u64, Decimal::ZERO);
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                match parse_directive(&line) {
                    Some(Directive::File(change, path)) => {
                        if let Err(e) = progress.file_changed(&path, change).await {
                            warn!(task_id = %task.id, path = %path, error = %e, "Failed to record file change");
                        }
                    }
                    Some(Directive::Usage(tokens, cost)) => {
                        usage.0 += tokens;
                        usage.1 += cost;
                    }
                    None => {
                        if tail.len() == SUMMARY_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            }
            Ok::<_, std::io::Error>((tail, usage))
        };

        let (out, err) = tokio::join!(read_stdout, read_stderr);
        let (tail, (tokens, cost)) = out.map_err(|e| ExecutionError::Failed {
            task_id: task.id,
            reason: format!("reading output: {e}"),
        })?;
        let status = child.wait().await.map_err(|e| ExecutionError::Failed {
            task_id: task.id,
            reason: format!("waiting for command: {e}"),
        })?;

        let mut result = if status.success() {
            TaskResult::succeeded(tail.into_iter().collect::<Vec<_>>().join("\n"))
        } else {
            let code = status.code().unwrap_or(-1);
            let mut stderr = err.trim().to_string();
            if stderr.len() > MAX_STDERR {
                let mut cut = stderr.len() - MAX_STDERR;
                while !stderr.is_char_boundary(cut) {
                    cut += 1;
                }
                stderr = stderr[cut..].to_string();
            }
            let message = if stderr.is_empty() {
                format!("exit code {code}")
            } else {
                format!("exit code {code}: {stderr}")
            };
            let mut failed = TaskResult::failed(message);
            failed.summary = tail.into_iter().collect::<Vec<_>>().join("\n");
            failed
        };
        result.files_changed = progress.files_changed().await;
        result.tokens_used = tokens;
        result.cost_usd = cost;
        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(task_id = %task.id, success = result.success, ms = result.duration_ms, "Command finished");
        Ok(result)
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn kind(&self) -> &str {
        "shell"
    }

    async fn execute(
        &self,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<TaskResult, ExecutionError> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.run(task, progress))
                .await
                .map_err(|_| ExecutionError::Timeout {
                    task_id: task.id,
                    timeout,
                })?,
            None => self.run(task, progress).await,
        }
    }
}
