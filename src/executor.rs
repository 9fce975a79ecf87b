//! Task execution: the executor seam, its execution contract (timeout,
//! retries, failure codes) and the two built-in executors.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ExecutorConfig;

#[derive(Debug, Clone)]
pub struct ExecutionContract {
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecutionContract {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            timeout_seconds: config.timeout_seconds,
            retries: config.retries,
            retry_backoff_ms: config.retry_backoff_millis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Timeout,
    CliMissing,
    Unavailable,
    NonZeroExit,
    Unknown,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::Timeout => write!(f, "timeout"),
            FailureCode::CliMissing => write!(f, "cli_missing"),
            FailureCode::Unavailable => write!(f, "unavailable"),
            FailureCode::NonZeroExit => write!(f, "nonzero_exit"),
            FailureCode::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub code: FailureCode,
    pub message: String,
}

impl ExecutionError {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Turns a task description into a result string.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, description: &str) -> Result<String, ExecutionError>;
}

/// Run an executor under a contract: each attempt is bounded by the timeout,
/// failed attempts are retried after a fixed backoff.
pub async fn execute_with_contract(
    executor: Arc<dyn TaskExecutor>,
    description: &str,
    contract: &ExecutionContract,
) -> Result<String, ExecutionError> {
    let attempts = contract.retries + 1;
    let timeout = Duration::from_secs(contract.timeout_seconds);
    let mut last_error: Option<ExecutionError> = None;

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, executor.execute(description)).await {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(err)) => {
                tracing::warn!(
                    executor = executor.name(),
                    "Execution attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    err
                );
                let retryable = err.code != FailureCode::CliMissing;
                last_error = Some(err);
                if !retryable {
                    break;
                }
            }
            Err(_) => {
                last_error = Some(ExecutionError::new(
                    FailureCode::Timeout,
                    format!("execution exceeded timeout of {}s", contract.timeout_seconds),
                ));
                tracing::warn!(
                    executor = executor.name(),
                    "Execution attempt {}/{} timed out",
                    attempt,
                    attempts
                );
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(contract.retry_backoff_ms)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ExecutionError::new(FailureCode::Unknown, "execution failed for unknown reason")
    }))
}

pub fn classify_error(message: &str) -> ExecutionError {
    let m = message.to_lowercase();
    let code = if m.contains("not found")
        || m.contains("no such file")
        || m.contains("command not found")
    {
        FailureCode::CliMissing
    } else if m.contains("not available")
        || m.contains("connection")
        || m.contains("timeout")
        || m.contains("timed out")
    {
        FailureCode::Unavailable
    } else {
        FailureCode::Unknown
    };

    ExecutionError::new(code, message)
}

/// Runs a local program with the task description as its final argument and
/// returns its stdout.
pub struct CliExecutor {
    program: String,
    args: Vec<String>,
}

impl CliExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl TaskExecutor for CliExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, description: &str) -> Result<String, ExecutionError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(description)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| classify_error(&format!("{}: {}", self.program, e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ExecutionError::new(
                FailureCode::NonZeroExit,
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            ))
        }
    }
}

/// Placeholder executor that acknowledges the task without doing any work.
pub struct EchoExecutor {
    agent_id: String,
}

impl EchoExecutor {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for EchoExecutor {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, description: &str) -> Result<String, ExecutionError> {
        Ok(format!("Task processed by {}: {}", self.agent_id, description))
    }
}

/// Build the executor described by the settings: a CLI program when one is
/// configured, the echo placeholder otherwise.
pub fn from_config(config: &ExecutorConfig, agent_id: &str) -> Arc<dyn TaskExecutor> {
    match config.program.as_deref().map(str::trim) {
        Some(program) if !program.is_empty() => {
            Arc::new(CliExecutor::new(program, config.args.clone()))
        }
        _ => Arc::new(EchoExecutor::new(agent_id)),
    }
}
