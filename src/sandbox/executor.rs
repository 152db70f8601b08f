//! Process executor
//!
//! Spawns a validated invocation as a child process and owns its whole
//! lifetime: deadline, output capture, and reaping.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::collector::collect_capped;
use crate::config::SandboxConfig;
use crate::error::GatewayError;
use crate::metrics;
use crate::validator::Invocation;

/// Outcome of one completed execution. Producing one of these is success
/// at the transport level even when the child failed or timed out.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ExecutionResult {
    /// Exit code; `None` when the child was killed by the deadline or a signal
    pub exit_code: Option<i32>,

    /// Captured stdout, lossily decoded
    pub stdout: String,

    /// Captured stderr, lossily decoded
    pub stderr: String,

    /// Whether stdout hit the output cap
    pub stdout_truncated: bool,

    /// Whether stderr hit the output cap
    pub stderr_truncated: bool,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,

    /// Whether the wall-clock deadline killed the child
    pub timed_out: bool,
}

/// Executes invocations under a global concurrency ceiling.
#[derive(Debug)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    slots: Arc<Semaphore>,
}

impl ProcessSandbox {
    /// Create a sandbox and ensure the scratch directory exists.
    ///
    /// # Errors
    ///
    /// Fails if the scratch directory cannot be created.
    pub fn new(config: SandboxConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.scratch_dir)?;
        let slots = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self { config, slots })
    }

    /// Number of executions that could start right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run an invocation to completion.
    ///
    /// The child gets an explicit argument vector, a cleared environment
    /// with only allow-listed variables passed through, a null stdin, and
    /// the scratch directory as its working directory. If the deadline
    /// elapses the child is killed and reaped, and the result carries
    /// `timed_out = true` with whatever output was captured.
    ///
    /// # Errors
    ///
    /// - `Overloaded` when the concurrency ceiling is reached
    /// - `SandboxFault` when the process cannot be spawned at all
    pub async fn execute(&self, invocation: &Invocation) -> Result<ExecutionResult, GatewayError> {
        // Fail fast rather than queue: a queued caller would time out
        // anyway, and queuing hides saturation from the metrics.
        let _permit = self
            .slots
            .try_acquire()
            .map_err(|_| GatewayError::Overloaded)?;

        metrics::ACTIVE_EXECUTIONS.inc();
        let result = self.run_child(invocation).await;
        metrics::ACTIVE_EXECUTIONS.dec();
        result
    }

    async fn run_child(&self, invocation: &Invocation) -> Result<ExecutionResult, GatewayError> {
        let started = Instant::now();

        let mut command = Command::new(invocation.program());
        command
            .args(invocation.args())
            .current_dir(invocation.working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Host environment never leaks: start empty, copy only what the
        // allow-list names and the host actually has.
        command.env_clear();
        for name in invocation.env_allowlist() {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }

        let mut child = command.spawn().map_err(|e| GatewayError::SandboxFault {
            detail: format!("failed to spawn '{}': {}", invocation.program(), e),
        })?;

        debug!(
            program = invocation.program(),
            timeout_secs = invocation.timeout().as_secs(),
            "spawned child process"
        );

        // Stdout/stderr handles exist because both were piped above.
        let stdout = child.stdout.take().ok_or_else(|| GatewayError::SandboxFault {
            detail: "child stdout handle missing".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| GatewayError::SandboxFault {
            detail: "child stderr handle missing".to_string(),
        })?;

        let cap = invocation.output_cap();
        let stdout_task = tokio::spawn(collect_capped(stdout, cap));
        let stderr_task = tokio::spawn(collect_capped(stderr, cap));

        let mut timed_out = false;
        let exit_status = match tokio::time::timeout(invocation.timeout(), child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                return Err(GatewayError::SandboxFault {
                    detail: format!("wait on '{}' failed: {}", invocation.program(), e),
                });
            }
            Err(_) => {
                timed_out = true;
                warn!(
                    program = invocation.program(),
                    timeout_secs = invocation.timeout().as_secs(),
                    "deadline elapsed, killing child"
                );
                // start_kill then wait: the child must be reaped, never
                // left as a zombie.
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        // Pipes close once the child is gone, so the collectors finish.
        let stdout_out = stdout_task
            .await
            .map_err(|e| GatewayError::SandboxFault {
                detail: format!("stdout collector panicked: {}", e),
            })?
            .map_err(|e| GatewayError::SandboxFault {
                detail: format!("stdout read failed: {}", e),
            })?;
        let stderr_out = stderr_task
            .await
            .map_err(|e| GatewayError::SandboxFault {
                detail: format!("stderr collector panicked: {}", e),
            })?
            .map_err(|e| GatewayError::SandboxFault {
                detail: format!("stderr read failed: {}", e),
            })?;

        let duration = started.elapsed();
        metrics::EXECUTION_DURATION_SECONDS.observe(duration.as_secs_f64());

        let result = ExecutionResult {
            exit_code: exit_status.and_then(|s| s.code()),
            stdout_truncated: stdout_out.truncated,
            stderr_truncated: stderr_out.truncated,
            stdout: stdout_out.into_string(),
            stderr: stderr_out.into_string(),
            duration_ms: duration_ms(duration),
            timed_out,
        };

        info!(
            program = invocation.program(),
            exit_code = ?result.exit_code,
            timed_out = result.timed_out,
            duration_ms = result.duration_ms,
            "execution finished"
        );

        Ok(result)
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
