//! Docker backend built on bollard

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures::StreamExt;

use super::{ExecSpec, ExecStatus, ExecutionEngine, InstanceSpec, InstanceState, OutputStream};
use crate::config::EngineConfig;
use crate::types::EngineError;

/// Execution engine talking to a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the configured endpoint, or the local defaults
    /// (`DOCKER_HOST`, then the platform socket) when none is set.
    ///
    /// Connecting is lazy: an unreachable daemon surfaces on the first call.
    pub fn connect(config: &EngineConfig) -> Result<Self, EngineError> {
        let timeout = config.connect_timeout.as_secs().max(1);

        let docker = match config.host.as_deref() {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, timeout, API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, timeout, API_DEFAULT_VERSION),
        }
        .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        tracing::debug!(endpoint = ?config.host, "Docker client configured");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Map a bollard error, keeping HTTP status information where the daemon
/// answered and treating everything else as a transport failure.
fn map_error(operation: &'static str) -> impl FnOnce(BollardError) -> EngineError {
    move |error| match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::request(operation, format!("HTTP {}: {}", status_code, message)),
        other => EngineError::Unreachable(format!("{}: {}", operation, other)),
    }
}

#[async_trait]
impl ExecutionEngine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map_err(map_error("ping"))?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut progress = self.docker.create_image(options, None, None);
        while let Some(update) = progress.next().await {
            update.map_err(map_error("pull_image"))?;
        }
        Ok(())
    }

    async fn inspect_instance(&self, name: &str) -> Result<Option<InstanceState>, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(Some(InstanceState {
                id: details.id.unwrap_or_else(|| name.to_string()),
                name: name.to_string(),
                running: details.state.and_then(|s| s.running).unwrap_or(false),
            })),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(map_error("inspect_instance")(e)),
        }
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, EngineError> {
        let mounts = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.volume.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            pids_limit: Some(spec.pids_limit),
            cap_drop: Some(spec.cap_drop.clone()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            network_mode: Some(spec.network.mode().to_string()),
            mounts: Some(mounts),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(spec.network == super::NetworkAccess::None),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        });

        let created = self
            .docker
            .create_container(options, config)
            .await
            .map_err(map_error("create_instance"))?;

        for warning in &created.warnings {
            tracing::warn!(instance = %spec.name, "Engine warning on create: {}", warning);
        }

        Ok(created.id)
    }

    async fn start_instance(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error("start_instance"))
    }

    async fn remove_instance(&self, id: &str) -> Result<(), EngineError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        self.docker
            .remove_container(id, options)
            .await
            .map_err(map_error("remove_instance"))
    }

    async fn extract_archive(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), EngineError> {
        let options = Some(UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        });
        self.docker
            .upload_to_container(id, options, archive)
            .await
            .map_err(map_error("extract_archive"))
    }

    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String, EngineError> {
        let options = CreateExecOptions {
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(map_error("create_exec"))?;
        Ok(created.id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<OutputStream, EngineError> {
        let options = Some(StartExecOptions {
            detach: false,
            tty: false,
            output_capacity: None,
        });

        match self
            .docker
            .start_exec(exec_id, options)
            .await
            .map_err(map_error("start_exec"))?
        {
            StartExecResults::Attached { output, .. } => Ok(output
                .map(|chunk| {
                    chunk
                        .map(|log| log.into_bytes())
                        .map_err(map_error("exec_output"))
                })
                .boxed()),
            StartExecResults::Detached => Err(EngineError::request(
                "start_exec",
                "engine started the exec detached",
            )),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, EngineError> {
        let info = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(map_error("inspect_exec"))?;
        Ok(ExecStatus {
            running: info.running.unwrap_or(false),
            exit_code: info.exit_code,
        })
    }
}
