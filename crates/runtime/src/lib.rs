//! codebox sandbox runtime
//!
//! Compiles and runs untrusted C# submissions inside network-isolated,
//! resource-capped containers. [`Pipeline`] is the entry point: it takes
//! source text and returns a classified [`Outcome`]. The container backend is
//! abstracted behind [`ExecutionEngine`], with a Docker implementation and a
//! scripted mock for tests.

pub mod archive;
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod sandbox;
pub mod types;

pub use archive::{ArchiveWriter, TarArchive};
pub use config::{Config, ConfigError, LogFormat};
pub use engine::{DockerEngine, ExecutionEngine, MockEngine};
pub use pipeline::{BuildStage, Outcome, Phase, Pipeline, PipelineError};
pub use sandbox::{ExecutionResult, SandboxManager, SandboxPool};
pub use types::*;
