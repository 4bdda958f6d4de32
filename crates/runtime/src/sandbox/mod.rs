//! Sandbox lifecycle management
//!
//! A sandbox is a long-lived, network-isolated container with fixed resource
//! limits, a working-directory volume and a shared package-cache volume. The
//! request path creates sandboxes lazily and never removes them; the only
//! instances it removes are transient helpers it spawned itself. Because a
//! sandbox outlives submissions, each submission starts with [`SandboxManager::reset`].

pub mod exec;
pub mod pool;
pub mod probe;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::archive::TarArchive;
use crate::config::{EngineConfig, SandboxConfig};
use crate::engine::{ExecutionEngine, InstanceSpec, NetworkAccess, VolumeMount};
use crate::types::{EngineError, SandboxError, SourceFile};

pub use exec::{CommandExecutor, ExecRequest, ExecutionResult};
pub use pool::{SandboxLease, SandboxPool};
pub use probe::ReadinessProber;

/// Label attached to every instance this runtime creates
pub const MANAGED_LABEL: &str = "dev.codebox.managed";

/// Opaque reference to a running instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    id: String,
    name: String,
}

impl InstanceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Run an engine call under a wall-clock limit
pub(crate) async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<Result<T, EngineError>, SandboxError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SandboxError::EngineTimeout { operation, limit })
}

/// Creates, starts and feeds sandbox instances
pub struct SandboxManager {
    engine: Arc<dyn ExecutionEngine>,
    image: String,
    call_timeout: Duration,
    pull_timeout: Duration,
    config: SandboxConfig,
    image_checked: AtomicBool,
}

impl SandboxManager {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        engine_config: &EngineConfig,
        config: SandboxConfig,
    ) -> Self {
        Self {
            engine,
            image: engine_config.image.clone(),
            call_timeout: engine_config.call_timeout,
            pull_timeout: engine_config.pull_timeout,
            config,
            image_checked: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Volume backing the working directory of the sandbox called `name`
    pub fn work_volume(name: &str) -> String {
        format!("{}-work", name)
    }

    /// Creation spec for the sandbox called `name`: no network, every
    /// capability dropped, capped memory and process count.
    pub fn instance_spec(&self, name: &str) -> InstanceSpec {
        let mut spec = self.spec_with_network(name, name, NetworkAccess::None);
        spec.mounts.insert(
            0,
            VolumeMount {
                volume: Self::work_volume(name),
                target: self.config.working_dir.clone(),
            },
        );
        spec
    }

    /// Common shape of sandboxes and helpers. Only the cache volume is
    /// mounted; the working directory stays in the instance filesystem.
    fn spec_with_network(
        &self,
        name: &str,
        sandbox: &str,
        network: NetworkAccess,
    ) -> InstanceSpec {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert("dev.codebox.sandbox".to_string(), sandbox.to_string());

        // `Config::validate` caps memory_mb; unvalidated configs saturate
        let memory_bytes = self
            .config
            .memory_mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| i64::try_from(bytes).ok())
            .unwrap_or(i64::MAX);

        InstanceSpec {
            name: name.to_string(),
            image: self.image.clone(),
            command: self.config.keep_alive.clone(),
            working_dir: self.config.working_dir.clone(),
            network,
            memory_bytes,
            pids_limit: self.config.pids_limit,
            cap_drop: vec!["ALL".to_string()],
            mounts: vec![VolumeMount {
                volume: self.config.cache_volume.clone(),
                target: self.config.cache_mount.clone(),
            }],
            labels,
        }
    }

    /// Make sure the sandbox called `name` exists and is running.
    ///
    /// Idempotent: an existing instance is reused as-is (its limits are never
    /// touched) and only started if it was stopped. Does not retry; an
    /// unreachable engine yields [`SandboxError::Connectivity`].
    ///
    /// The image is refreshed on the first call and before any creation.
    pub async fn ensure_running(&self, name: &str) -> Result<InstanceHandle, SandboxError> {
        let refreshed = !self.image_checked.swap(true, Ordering::SeqCst);
        if refreshed {
            self.refresh_image().await;
        }

        let existing = bounded(
            "inspect_instance",
            self.call_timeout,
            self.engine.inspect_instance(name),
        )
        .await?
        .map_err(|e| SandboxError::provisioning(name, e))?;

        let (id, running) = match existing {
            Some(state) => (state.id, state.running),
            None => {
                if !refreshed {
                    self.refresh_image().await;
                }
                (self.create(name).await?, false)
            }
        };

        if !running {
            tracing::info!(instance = %name, "Starting sandbox");
            bounded(
                "start_instance",
                self.call_timeout,
                self.engine.start_instance(&id),
            )
            .await?
            .map_err(|e| SandboxError::provisioning(name, e))?;
        }

        Ok(InstanceHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn create(&self, name: &str) -> Result<String, SandboxError> {
        let spec = self.instance_spec(name);
        tracing::info!(
            instance = %name,
            image = %spec.image,
            memory_mb = self.config.memory_mb,
            pids_limit = spec.pids_limit,
            "Creating sandbox"
        );

        let created = bounded(
            "create_instance",
            self.call_timeout,
            self.engine.create_instance(&spec),
        )
        .await?;

        match created {
            Ok(id) => Ok(id),
            // Lost a race against another process creating the same name
            Err(EngineError::Conflict(_)) => bounded(
                "inspect_instance",
                self.call_timeout,
                self.engine.inspect_instance(name),
            )
            .await?
            .map_err(|e| SandboxError::provisioning(name, e))?
            .map(|state| state.id)
            .ok_or_else(|| SandboxError::Provisioning {
                name: name.to_string(),
                reason: "instance vanished after name conflict".to_string(),
            }),
            Err(e) => Err(SandboxError::provisioning(name, e)),
        }
    }

    /// Best-effort image refresh. A cached image is an acceptable substitute,
    /// so failures are logged and ignored. Bounded by the pull timeout, not
    /// the call timeout: abandoning a pull cancels it.
    async fn refresh_image(&self) {
        let pulled = bounded(
            "pull_image",
            self.pull_timeout,
            self.engine.pull_image(&self.image),
        )
        .await;

        match pulled {
            Ok(Ok(())) => tracing::debug!(image = %self.image, "Image up to date"),
            Ok(Err(e)) => tracing::warn!(
                image = %self.image,
                "Image pull failed, using cached copy: {}",
                e
            ),
            Err(e) => tracing::warn!(image = %self.image, "Image pull abandoned: {}", e),
        }
    }

    /// Kill every process a previous submission left behind and empty the
    /// working directory. Must succeed before [`Self::inject`]; anything left
    /// in the directory would be picked up by the next restore and build.
    pub async fn reset(
        &self,
        executor: &CommandExecutor,
        instance: &InstanceHandle,
    ) -> Result<(), SandboxError> {
        let script = format!("{}; find \"$1\" -mindepth 1 -delete", exec::KILL_STRAYS);
        let request = ExecRequest::new(
            &["sh", "-c", script.as_str(), "sh", self.config.working_dir.as_str()],
            "/",
            self.call_timeout,
        );

        let result = executor.exec(instance, &request).await?;
        if result.succeeded() {
            tracing::debug!(instance = %instance.name, "Working directory reset");
            return Ok(());
        }

        Err(SandboxError::Injection {
            name: instance.name.clone(),
            reason: format!(
                "working directory cleanup failed (exit {:?}, timed out: {}): {}",
                result.exit_code,
                result.timed_out,
                result.output.trim_end()
            ),
        })
    }

    /// Archive `files` and extract them into the instance working directory.
    pub async fn inject(
        &self,
        instance: &InstanceHandle,
        files: &[SourceFile],
    ) -> Result<(), SandboxError> {
        let archive = TarArchive::from_files(files)?;
        tracing::debug!(
            instance = %instance.name,
            files = files.len(),
            bytes = archive.len(),
            "Injecting files"
        );

        bounded(
            "extract_archive",
            self.call_timeout,
            self.engine
                .extract_archive(&instance.id, &self.config.working_dir, archive),
        )
        .await?
        .map_err(|e| match e {
            EngineError::Unreachable(reason) => SandboxError::Connectivity {
                waited: Duration::ZERO,
                reason,
            },
            other => SandboxError::Injection {
                name: instance.name.clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Start a short-lived helper for `sandbox` with outbound network access.
    /// It shares the package cache but not the working directory, which
    /// starts empty. Callers must hand it back to [`Self::discard`].
    pub async fn spawn_helper(
        &self,
        sandbox: &InstanceHandle,
        purpose: &str,
    ) -> Result<InstanceHandle, SandboxError> {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}-{}", sandbox.name, purpose, &short[..8]);
        let spec = self.spec_with_network(&name, &sandbox.name, NetworkAccess::Bridge);

        tracing::info!(instance = %name, "Starting transient helper");
        let id = bounded(
            "create_instance",
            self.call_timeout,
            self.engine.create_instance(&spec),
        )
        .await?
        .map_err(|e| SandboxError::provisioning(&name, e))?;

        let handle = InstanceHandle { id, name };
        let started = bounded(
            "start_instance",
            self.call_timeout,
            self.engine.start_instance(&handle.id),
        )
        .await;
        match started {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(e)) => {
                self.discard(handle.clone()).await;
                Err(SandboxError::provisioning(&handle.name, e))
            }
            Err(e) => {
                self.discard(handle).await;
                Err(e)
            }
        }
    }

    /// Best-effort removal of a transient helper. Failures are logged only.
    pub async fn discard(&self, instance: InstanceHandle) {
        let removed = bounded(
            "remove_instance",
            self.call_timeout,
            self.engine.remove_instance(&instance.id),
        )
        .await;

        match removed {
            Ok(Ok(())) => tracing::debug!(instance = %instance.name, "Removed transient helper"),
            Ok(Err(e)) => {
                tracing::warn!(instance = %instance.name, "Failed to remove helper: {}", e)
            }
            Err(e) => tracing::warn!(instance = %instance.name, "Helper removal abandoned: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{MockEngine, ScriptedExec};

    fn manager(engine: Arc<MockEngine>) -> SandboxManager {
        let config = Config::default();
        SandboxManager::new(engine, &config.engine, config.sandbox)
    }

    #[tokio::test]
    async fn test_ensure_running_creates_once() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager(engine.clone());

        let first = manager.ensure_running("codebox-sandbox-0").await.unwrap();
        let second = manager.ensure_running("codebox-sandbox-0").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(engine.calls("create_instance"), 1);
        assert_eq!(engine.calls("start_instance"), 1);
        assert!(engine.instance("codebox-sandbox-0").unwrap().running);
    }

    #[tokio::test]
    async fn test_instance_spec_is_isolated() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager(engine.clone());
        manager.ensure_running("box").await.unwrap();

        let spec = engine.instance("box").unwrap().spec;
        assert_eq!(spec.network, NetworkAccess::None);
        assert_eq!(spec.cap_drop, vec!["ALL".to_string()]);
        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.pids_limit, 256);
        assert_eq!(spec.command[..2], ["sh".to_string(), "-c".to_string()]);
        assert!(spec.command[2].contains("while :; do sleep 1; done"));
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.volume == "codebox-nuget-cache" && m.target == "/root/.nuget/packages"));
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.volume == "box-work" && m.target == "/workspace"));
    }

    #[tokio::test]
    async fn test_stopped_instance_is_started_not_recreated() {
        let engine = Arc::new(MockEngine::new());
        let seeded = {
            let mut spec = manager(engine.clone()).instance_spec("box");
            spec.memory_bytes = 64 * 1024 * 1024;
            spec
        };
        let engine = Arc::new(MockEngine::new().with_instance(seeded, false));
        let manager = manager(engine.clone());

        manager.ensure_running("box").await.unwrap();

        assert_eq!(engine.calls("create_instance"), 0);
        assert_eq!(engine.calls("start_instance"), 1);
        // Existing limits are left alone
        assert_eq!(
            engine.instance("box").unwrap().spec.memory_bytes,
            64 * 1024 * 1024
        );
    }

    #[tokio::test]
    async fn test_pull_failure_is_not_fatal() {
        let engine = Arc::new(MockEngine::new().with_failing_pull());
        let manager = manager(engine.clone());

        assert!(manager.ensure_running("box").await.is_ok());
        assert_eq!(engine.calls("pull_image"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_connectivity_error() {
        let engine = Arc::new(MockEngine::new().unreachable());
        let manager = manager(engine.clone());

        let err = manager.ensure_running("box").await.unwrap_err();
        assert!(err.is_connectivity(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_inject_uploads_to_working_dir() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager(engine.clone());
        let handle = manager.ensure_running("box").await.unwrap();

        manager
            .inject(&handle, &[SourceFile::new("Program.cs", "class P {}")])
            .await
            .unwrap();

        let uploads = engine.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].path, "/workspace");
        assert_eq!(uploads[0].instance_id, handle.id());
        assert_eq!(&uploads[0].archive[..10], b"Program.cs");
    }

    #[tokio::test]
    async fn test_inject_rejects_bad_archive_before_engine() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager(engine.clone());
        let handle = manager.ensure_running("box").await.unwrap();

        let long_name = "d/".repeat(60) + "Program.cs";
        let err = manager
            .inject(&handle, &[SourceFile::new(long_name, "x")])
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Archive(_)));
        assert_eq!(engine.calls("extract_archive"), 0);
    }

    #[tokio::test]
    async fn test_helper_has_network_and_is_discarded() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager(engine.clone());
        let sandbox = manager.ensure_running("box").await.unwrap();

        let helper = manager.spawn_helper(&sandbox, "restore").await.unwrap();
        let record = engine.instance(helper.name()).unwrap();
        assert_eq!(record.spec.network, NetworkAccess::Bridge);
        // Only the cache is shared; the sandbox working directory never is
        assert_eq!(record.spec.mounts.len(), 1);
        assert_eq!(record.spec.mounts[0].volume, "codebox-nuget-cache");
        assert!(record.spec.mounts.iter().all(|m| m.target != "/workspace"));

        manager.discard(helper.clone()).await;
        assert!(engine.instance(helper.name()).unwrap().removed);
        // The sandbox itself is untouched
        assert!(engine.instance("box").unwrap().running);
    }

    #[tokio::test]
    async fn test_create_conflict_adopts_concurrent_instance() {
        let seeded = manager(Arc::new(MockEngine::new())).instance_spec("box");
        let engine = Arc::new(MockEngine::new().with_instance_created_concurrently(seeded));
        let manager = manager(engine.clone());
        let seeded_id = engine.instance("box").unwrap().id;

        let handle = manager.ensure_running("box").await.unwrap();

        assert_eq!(handle.id(), seeded_id);
        assert_eq!(engine.calls("create_instance"), 1);
        assert_eq!(engine.calls("inspect_instance"), 2);
        assert_eq!(engine.calls("start_instance"), 1);
        assert!(engine.instance("box").unwrap().running);
    }

    #[tokio::test]
    async fn test_slow_first_pull_outlasts_call_timeout() {
        let engine = Arc::new(MockEngine::new().with_pull_delay(Duration::from_millis(300)));
        let mut config = Config::default();
        config.engine.call_timeout = Duration::from_millis(50);
        config.engine.pull_timeout = Duration::from_secs(5);
        let manager = SandboxManager::new(engine.clone(), &config.engine, config.sandbox);

        manager.ensure_running("box").await.unwrap();

        assert_eq!(engine.calls("pull_image"), 1);
        assert!(engine.instance("box").unwrap().running);
    }

    #[tokio::test]
    async fn test_abandoned_pull_leaves_image_missing() {
        let engine = Arc::new(MockEngine::new().with_pull_delay(Duration::from_secs(5)));
        let mut config = Config::default();
        config.engine.pull_timeout = Duration::from_millis(50);
        let manager = SandboxManager::new(engine.clone(), &config.engine, config.sandbox);

        let err = manager.ensure_running("box").await.unwrap_err();
        assert!(
            matches!(
                err,
                SandboxError::Provisioning { ref reason, .. } if reason.contains("No such image")
            ),
            "unexpected error: {}",
            err
        );
    }

    #[tokio::test]
    async fn test_reset_kills_strays_and_empties_working_dir() {
        let engine = Arc::new(MockEngine::new());
        let manager = manager(engine.clone());
        let executor = CommandExecutor::new(engine.clone(), Duration::from_secs(5), 4096);
        let handle = manager.ensure_running("box").await.unwrap();

        manager.reset(&executor, &handle).await.unwrap();

        let log = engine.exec_log();
        assert_eq!(log.len(), 1);
        let command = &log[0].spec.command;
        assert_eq!(command[..2], ["sh".to_string(), "-c".to_string()]);
        assert!(command[2].contains("kill -9 -1"));
        assert!(command[2].contains("find \"$1\" -mindepth 1 -delete"));
        // The directory is passed as an argument, never spliced into the script
        assert_eq!(command.last().map(String::as_str), Some("/workspace"));
        assert_eq!(log[0].spec.working_dir, "/");
    }

    #[tokio::test]
    async fn test_failed_reset_is_injection_error() {
        let engine = Arc::new(
            MockEngine::new()
                .with_exec("-mindepth", ScriptedExec::exit(1, "find: permission denied")),
        );
        let manager = manager(engine.clone());
        let executor = CommandExecutor::new(engine.clone(), Duration::from_secs(5), 4096);
        let handle = manager.ensure_running("box").await.unwrap();

        let err = manager.reset(&executor, &handle).await.unwrap_err();
        assert!(matches!(err, SandboxError::Injection { .. }));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_memory_limit_saturates_instead_of_wrapping() {
        let engine = Arc::new(MockEngine::new());
        let mut config = Config::default();
        config.sandbox.memory_mb = u64::MAX / 1024;
        let manager = SandboxManager::new(engine, &config.engine, config.sandbox);

        assert_eq!(manager.instance_spec("box").memory_bytes, i64::MAX);
    }
}
