//! Command execution inside a running sandbox
//!
//! Output is read from the attached exec stream until it ends or the request
//! timeout elapses. A timeout only abandons the local read; the engine may
//! keep the process alive, which is why a timed-out result never carries an
//! exit code.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{bounded, InstanceHandle};
use crate::engine::{ExecSpec, ExecutionEngine};
use crate::types::SandboxError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const EXIT_POLL_ATTEMPTS: u32 = 40;

/// Upper bound for the exec that clears out stray processes
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Signals every process the caller may signal except init and the shell
/// itself. Init is the keep-alive loop, which also reaps what this leaves.
pub(crate) const KILL_STRAYS: &str = "kill -9 -1 2>/dev/null; true";

/// One command to run in a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub working_dir: String,
    pub timeout: Duration,
    pub env: Vec<String>,
}

impl ExecRequest {
    pub fn new<S: AsRef<str>>(
        command: &[S],
        working_dir: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.iter().map(|s| s.as_ref().to_string()).collect(),
            working_dir: working_dir.into(),
            timeout,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: &[(&str, &str)]) -> Self {
        self.env
            .extend(env.iter().map(|(key, value)| format!("{}={}", key, value)));
        self
    }
}

/// Result of one exec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit status; always `None` when the command timed out
    pub exit_code: Option<i64>,
    /// Combined stdout and stderr in arrival order
    pub output: String,
    pub timed_out: bool,
    /// The output stream failed before the command finished; `output` is partial
    pub stream_interrupted: bool,
    /// Output beyond the configured cap was dropped
    pub truncated: bool,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// The command may still be running in the instance: the read timed out
    /// or the engine never reported a final status.
    pub fn left_running(&self) -> bool {
        self.timed_out || self.exit_code.is_none()
    }
}

/// Accumulates output up to a byte limit
struct OutputBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    fn into_string(self) -> String {
        let output = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            format!("{}\n... [output truncated at {} bytes]", output, self.limit)
        } else {
            output
        }
    }
}

/// Runs commands in sandboxes through the engine's exec interface
pub struct CommandExecutor {
    engine: Arc<dyn ExecutionEngine>,
    call_timeout: Duration,
    max_output_bytes: usize,
}

impl CommandExecutor {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        call_timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            engine,
            call_timeout,
            max_output_bytes,
        }
    }

    /// Run `request` in `instance` and capture its combined output.
    ///
    /// Engine errors while reading output end the read instead of failing the
    /// call, and are reported through `stream_interrupted`.
    pub async fn exec(
        &self,
        instance: &InstanceHandle,
        request: &ExecRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let spec = ExecSpec {
            command: request.command.clone(),
            working_dir: request.working_dir.clone(),
            env: request.env.clone(),
        };

        let exec_id = bounded(
            "create_exec",
            self.call_timeout,
            self.engine.create_exec(instance.id(), &spec),
        )
        .await??;

        let mut stream = bounded(
            "start_exec",
            self.call_timeout,
            self.engine.start_exec(&exec_id),
        )
        .await??;

        let mut output = OutputBuffer::new(self.max_output_bytes);
        let mut stream_interrupted = false;

        let finished = tokio::time::timeout(request.timeout, async {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => output.push(&bytes),
                    Err(e) => {
                        tracing::warn!(
                            instance = %instance.name(),
                            exec = %exec_id,
                            "Output stream ended abnormally: {}",
                            e
                        );
                        stream_interrupted = true;
                        break;
                    }
                }
            }
        })
        .await;
        drop(stream);

        let timed_out = finished.is_err();
        let exit_code = if timed_out {
            tracing::warn!(
                instance = %instance.name(),
                command = ?request.command,
                timeout = ?request.timeout,
                "Command timed out"
            );
            None
        } else {
            self.exit_code(&exec_id).await?
        };

        let truncated = output.truncated;
        if truncated {
            tracing::warn!(
                instance = %instance.name(),
                "Output truncated at {} bytes",
                self.max_output_bytes
            );
        }

        let result = ExecutionResult {
            exit_code,
            output: output.into_string(),
            timed_out,
            stream_interrupted,
            truncated,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::debug!(
            instance = %instance.name(),
            command = ?request.command,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "Command finished"
        );

        Ok(result)
    }

    /// The engine can report end-of-stream slightly before the exec is
    /// reaped, so poll briefly until it stops running.
    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>, SandboxError> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            let status = bounded(
                "inspect_exec",
                self.call_timeout,
                self.engine.inspect_exec(exec_id),
            )
            .await??;
            if !status.running {
                return Ok(status.exit_code);
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        tracing::warn!(exec = %exec_id, "Exec still running after output ended");
        Ok(None)
    }

    /// Kill every process left in `instance` by earlier commands. Best effort;
    /// failures are logged only.
    pub async fn kill_strays(&self, instance: &InstanceHandle) {
        let request = ExecRequest::new(&["sh", "-c", KILL_STRAYS], "/", KILL_TIMEOUT);
        match self.exec(instance, &request).await {
            Ok(result) if result.succeeded() => {
                tracing::debug!(instance = %instance.name(), "Stray processes killed")
            }
            Ok(result) => tracing::warn!(
                instance = %instance.name(),
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                "Stray process cleanup did not complete"
            ),
            Err(e) => tracing::warn!(
                instance = %instance.name(),
                "Stray process cleanup failed: {}",
                e
            ),
        }
    }
}
