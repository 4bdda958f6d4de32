//! Two-stage package restore
//!
//! The offline stage restores from the shared package cache inside the
//! sandbox itself. When it fails and the online fallback is enabled, a
//! transient helper with network access restores the fixed manifest against
//! the remote feed, filling the shared cache. The helper never sees the
//! sandbox working directory. The offline stage is then repeated in the
//! sandbox, which never gains network access itself.

use std::time::Duration;

use super::project;
use crate::sandbox::{
    CommandExecutor, ExecRequest, ExecutionResult, InstanceHandle, SandboxManager,
};
use crate::types::{SandboxError, SourceFile};

/// Result of the restore phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreReport {
    Restored { online: bool },
    Failed { diagnostics: String, timed_out: bool },
}

#[derive(Debug, Clone)]
pub struct RestoreStrategy {
    pub online_fallback: bool,
    pub timeout: Duration,
}

impl RestoreStrategy {
    pub fn new(online_fallback: bool, timeout: Duration) -> Self {
        Self {
            online_fallback,
            timeout,
        }
    }

    fn request(&self, command: Vec<&str>, working_dir: &str) -> ExecRequest {
        ExecRequest::new(&command, working_dir, self.timeout).with_env(&project::environment())
    }

    /// Offline restore in the sandbox. A restore that may still be running is
    /// killed before anything else happens in the sandbox.
    async fn offline(
        &self,
        executor: &CommandExecutor,
        sandbox: &InstanceHandle,
        working_dir: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let result = executor
            .exec(sandbox, &self.request(project::offline_restore(), working_dir))
            .await?;
        if result.left_running() {
            executor.kill_strays(sandbox).await;
        }
        Ok(result)
    }

    pub async fn restore(
        &self,
        manager: &SandboxManager,
        executor: &CommandExecutor,
        sandbox: &InstanceHandle,
    ) -> Result<RestoreReport, SandboxError> {
        let working_dir = manager.config().working_dir.as_str();

        let offline = self.offline(executor, sandbox, working_dir).await?;
        if offline.succeeded() {
            return Ok(RestoreReport::Restored { online: false });
        }

        if !self.online_fallback {
            return Ok(RestoreReport::Failed {
                diagnostics: offline.output,
                timed_out: offline.timed_out,
            });
        }

        tracing::info!(
            instance = %sandbox.name(),
            exit_code = ?offline.exit_code,
            "Offline restore failed, filling the cache from the remote feed"
        );

        let online = self.fill_cache(manager, executor, sandbox, working_dir).await?;
        if !online.succeeded() {
            return Ok(RestoreReport::Failed {
                diagnostics: combine(&[
                    ("offline restore", &offline),
                    ("online restore", &online),
                ]),
                timed_out: offline.timed_out || online.timed_out,
            });
        }

        let retry = self.offline(executor, sandbox, working_dir).await?;
        if retry.succeeded() {
            return Ok(RestoreReport::Restored { online: true });
        }

        Ok(RestoreReport::Failed {
            diagnostics: combine(&[
                ("offline restore", &offline),
                ("online restore", &online),
                ("offline restore after online", &retry),
            ]),
            timed_out: offline.timed_out || retry.timed_out,
        })
    }

    /// Restore the fixed manifest against the remote feed in a helper whose
    /// working directory holds nothing else
    async fn fill_cache(
        &self,
        manager: &SandboxManager,
        executor: &CommandExecutor,
        sandbox: &InstanceHandle,
        working_dir: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let helper = manager.spawn_helper(sandbox, "restore").await?;

        let manifest = [SourceFile::new(project::MANIFEST_PATH, project::manifest())];
        let online = async {
            manager.inject(&helper, &manifest).await?;
            executor
                .exec(&helper, &self.request(project::online_restore(), working_dir))
                .await
        }
        .await;
        manager.discard(helper).await;
        online
    }
}

fn combine(stages: &[(&str, &ExecutionResult)]) -> String {
    stages
        .iter()
        .map(|(label, result)| format!("{}:\n{}", label, result.output.trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n")
}
