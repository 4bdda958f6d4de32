//! Build/run pipeline
//!
//! Takes one source submission through validation, engine probing, sandbox
//! provisioning, file injection, restore, build and run, and classifies the
//! result. [`Pipeline::submit`] never fails and never panics outward: every
//! error is converted into an [`Outcome`].
//!
//! A sandbox is reset before every injection, and any stage that may have
//! left a process behind is followed by a kill before the lease is released.

pub mod project;
pub mod restore;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::Instrument;

use crate::config::{Config, PipelineConfig};
use crate::engine::ExecutionEngine;
use crate::sandbox::{
    CommandExecutor, ExecRequest, ExecutionResult, ReadinessProber, SandboxManager, SandboxPool,
};
use crate::types::{SandboxError, SourceSubmission, SubmissionId, ValidationError};

pub use restore::{RestoreReport, RestoreStrategy};

/// Pipeline states in the order a submission passes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Probing,
    Provisioning,
    Injecting,
    Restoring,
    Building,
    Running,
    Done,
    BuildFailed,
    InfraFailed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Probing => "probing",
            Phase::Provisioning => "provisioning",
            Phase::Injecting => "injecting",
            Phase::Restoring => "restoring",
            Phase::Building => "building",
            Phase::Running => "running",
            Phase::Done => "done",
            Phase::BuildFailed => "build_failed",
            Phase::InfraFailed => "infra_failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Restore,
    Build,
}

/// Terminal result of one submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Rejected before any engine contact
    ValidationError { message: String },
    /// Restore or compilation failed; the program was not run
    BuildError {
        stage: BuildStage,
        diagnostics: String,
        timed_out: bool,
    },
    /// The program ran. A non-zero exit code is still a run result.
    RunResult {
        exit_code: Option<i64>,
        output: String,
        timed_out: bool,
        truncated: bool,
        stream_interrupted: bool,
        duration_ms: u64,
    },
    InfrastructureError { phase: Phase, message: String },
}

impl Outcome {
    fn run(result: ExecutionResult) -> Self {
        Outcome::RunResult {
            exit_code: result.exit_code,
            output: result.output,
            timed_out: result.timed_out,
            truncated: result.truncated,
            stream_interrupted: result.stream_interrupted,
            duration_ms: result.duration_ms,
        }
    }

    /// The state the pipeline stopped in
    pub fn phase(&self) -> Phase {
        match self {
            Outcome::ValidationError { .. } => Phase::Idle,
            Outcome::BuildError { .. } => Phase::BuildFailed,
            Outcome::RunResult { .. } => Phase::Done,
            Outcome::InfrastructureError { .. } => Phase::InfraFailed,
        }
    }

    /// Process exit status used by the command line front end
    pub fn exit_status(&self) -> i32 {
        match self {
            Outcome::RunResult { .. } => 0,
            Outcome::BuildError { .. } => 1,
            Outcome::ValidationError { .. } => 2,
            Outcome::InfrastructureError { .. } => 3,
        }
    }
}

/// Errors that end a submission early
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{source}")]
    Infrastructure {
        phase: Phase,
        #[source]
        source: SandboxError,
    },
}

impl PipelineError {
    fn at(phase: Phase) -> impl FnOnce(SandboxError) -> PipelineError {
        move |source| PipelineError::Infrastructure { phase, source }
    }

    pub fn into_outcome(self) -> Outcome {
        match self {
            PipelineError::Validation(e) => Outcome::ValidationError {
                message: e.to_string(),
            },
            PipelineError::Infrastructure { phase, source } => Outcome::InfrastructureError {
                phase,
                message: source.to_string(),
            },
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    prober: ReadinessProber,
    pool: SandboxPool,
    executor: CommandExecutor,
    restore: RestoreStrategy,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn ExecutionEngine>, config: &Config) -> Self {
        let manager = SandboxManager::new(engine.clone(), &config.engine, config.sandbox.clone());
        let pipeline = config.pipeline.clone();

        Self {
            prober: ReadinessProber::new(engine.clone(), pipeline.probe_interval),
            pool: SandboxPool::new(Arc::new(manager)),
            executor: CommandExecutor::new(
                engine,
                config.engine.call_timeout,
                pipeline.max_output_bytes,
            ),
            restore: RestoreStrategy::new(pipeline.online_restore, pipeline.restore_timeout),
            config: pipeline,
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    pub fn prober(&self) -> &ReadinessProber {
        &self.prober
    }

    fn manager(&self) -> &SandboxManager {
        self.pool.manager()
    }

    /// Run one submission to completion
    pub async fn submit(&self, code: &str) -> Outcome {
        let id = SubmissionId::new();
        let span = tracing::info_span!("submission", id = %id);
        let started = Instant::now();
        let phase = Mutex::new(Phase::Idle);

        let result = AssertUnwindSafe(self.process(code, &phase))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => e.into_outcome(),
            Err(_) => {
                let phase = *phase.lock();
                span.in_scope(|| tracing::error!(%phase, "Pipeline panicked"));
                Outcome::InfrastructureError {
                    phase,
                    message: "internal error".to_string(),
                }
            }
        };

        span.in_scope(|| match &outcome {
            Outcome::InfrastructureError { phase, message } => tracing::error!(
                %phase,
                elapsed = ?started.elapsed(),
                "Submission failed: {}",
                message
            ),
            other => tracing::info!(
                outcome = %other.phase(),
                elapsed = ?started.elapsed(),
                "Submission finished"
            ),
        });

        outcome
    }

    fn enter(&self, current: &Mutex<Phase>, next: Phase) {
        *current.lock() = next;
        tracing::debug!(phase = %next, "Entering phase");
    }

    async fn process(&self, code: &str, phase: &Mutex<Phase>) -> Result<Outcome, PipelineError> {
        let submission = SourceSubmission::new(code, self.config.max_source_chars);
        submission.validate()?;

        self.enter(phase, Phase::Probing);
        self.prober
            .wait_ready(self.config.probe_deadline)
            .await
            .map_err(PipelineError::at(Phase::Probing))?;

        self.enter(phase, Phase::Provisioning);
        let lease = self
            .pool
            .checkout()
            .await
            .map_err(PipelineError::at(Phase::Provisioning))?;
        let instance = self
            .manager()
            .ensure_running(lease.name())
            .await
            .map_err(PipelineError::at(Phase::Provisioning))?;

        self.enter(phase, Phase::Injecting);
        self.manager()
            .reset(&self.executor, &instance)
            .await
            .map_err(PipelineError::at(Phase::Injecting))?;
        self.manager()
            .inject(&instance, &project::files(&submission.code))
            .await
            .map_err(PipelineError::at(Phase::Injecting))?;

        self.enter(phase, Phase::Restoring);
        let restored = self
            .restore
            .restore(self.manager(), &self.executor, &instance)
            .await
            .map_err(PipelineError::at(Phase::Restoring))?;
        if let RestoreReport::Failed {
            diagnostics,
            timed_out,
        } = restored
        {
            return Ok(Outcome::BuildError {
                stage: BuildStage::Restore,
                diagnostics,
                timed_out,
            });
        }

        self.enter(phase, Phase::Building);
        let build = self
            .executor
            .exec(
                &instance,
                &self.request(project::build(), self.config.build_timeout),
            )
            .await
            .map_err(PipelineError::at(Phase::Building))?;
        if build.left_running() {
            self.executor.kill_strays(&instance).await;
        }
        if !build.succeeded() {
            return Ok(Outcome::BuildError {
                stage: BuildStage::Build,
                diagnostics: build.output,
                timed_out: build.timed_out,
            });
        }

        self.enter(phase, Phase::Running);
        let run = self
            .executor
            .exec(
                &instance,
                &self.request(project::run(), self.config.run_timeout),
            )
            .await
            .map_err(PipelineError::at(Phase::Running))?;
        if run.left_running() {
            self.executor.kill_strays(&instance).await;
        }

        self.enter(phase, Phase::Done);
        drop(lease);
        Ok(Outcome::run(run))
    }

    fn request(&self, command: Vec<&str>, timeout: Duration) -> ExecRequest {
        ExecRequest::new(&command, &self.manager().config().working_dir, timeout)
            .with_env(&project::environment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_json_is_tagged() {
        let outcome = Outcome::InfrastructureError {
            phase: Phase::Probing,
            message: "down".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "infrastructure_error");
        assert_eq!(json["phase"], "probing");

        let build = Outcome::BuildError {
            stage: BuildStage::Build,
            diagnostics: "CS1002".to_string(),
            timed_out: false,
        };
        let json = serde_json::to_value(&build).unwrap();
        assert_eq!(json["kind"], "build_error");
        assert_eq!(json["stage"], "build");
    }

    #[test]
    fn test_exit_status_per_outcome() {
        let run = Outcome::RunResult {
            exit_code: Some(7),
            output: String::new(),
            timed_out: false,
            truncated: false,
            stream_interrupted: false,
            duration_ms: 1,
        };
        assert_eq!(run.exit_status(), 0);
        assert_eq!(run.phase(), Phase::Done);

        let validation = Outcome::ValidationError {
            message: "empty".to_string(),
        };
        assert_eq!(validation.exit_status(), 2);
        assert_eq!(validation.phase(), Phase::Idle);
    }

    #[test]
    fn test_infrastructure_error_keeps_phase() {
        let err = PipelineError::at(Phase::Injecting)(SandboxError::PoolClosed);
        assert_eq!(
            err.into_outcome(),
            Outcome::InfrastructureError {
                phase: Phase::Injecting,
                message: "Sandbox pool is closed".to_string(),
            }
        );
    }
}
