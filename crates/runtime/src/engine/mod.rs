//! Execution engine abstraction
//!
//! The sandbox layer only talks to an engine through [`ExecutionEngine`], so the
//! Docker backend can be replaced by any system offering the same operations:
//! image pull, instance inspect/create/start/remove, archive extraction, exec
//! create/start/inspect, and a liveness ping.

pub mod docker;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::EngineError;

pub use docker::DockerEngine;
pub use mock::{MockEngine, ScriptedExec};

/// Combined stdout/stderr of an attached exec, chunk by chunk
pub type OutputStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Current state of a named instance as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub id: String,
    pub name: String,
    pub running: bool,
}

/// Network attachment for a new instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkAccess {
    /// No interfaces besides loopback
    None,
    /// Default bridge network with outbound access
    Bridge,
}

impl NetworkAccess {
    pub fn mode(&self) -> &'static str {
        match self {
            NetworkAccess::None => "none",
            NetworkAccess::Bridge => "bridge",
        }
    }
}

/// Named volume mounted into an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

/// Everything needed to create an instance. Fixed once the instance exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub network: NetworkAccess,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub cap_drop: Vec<String>,
    pub mounts: Vec<VolumeMount>,
    pub labels: HashMap<String, String>,
}

/// Command to register against a running instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: Vec<String>,
}

/// Exec status as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// Operations the sandbox layer needs from a container engine
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Liveness check
    async fn ping(&self) -> Result<(), EngineError>;

    /// Fetch or refresh an image
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Look up an instance by name, `None` if it does not exist
    async fn inspect_instance(&self, name: &str) -> Result<Option<InstanceState>, EngineError>;

    /// Create an instance and return its id
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, EngineError>;

    async fn start_instance(&self, id: &str) -> Result<(), EngineError>;

    /// Force-remove an instance
    async fn remove_instance(&self, id: &str) -> Result<(), EngineError>;

    /// Extract a tar archive into `path` inside the instance
    async fn extract_archive(&self, id: &str, path: &str, archive: Bytes)
        -> Result<(), EngineError>;

    /// Register a command and return the exec id
    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String, EngineError>;

    /// Start a registered exec attached to its combined output
    async fn start_exec(&self, exec_id: &str) -> Result<OutputStream, EngineError>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, EngineError>;
}
