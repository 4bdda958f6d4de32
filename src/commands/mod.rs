pub mod doctor;
pub mod run;
pub mod warm;

use anyhow::Context;
use codebox_runtime::{Config, DockerEngine};
use std::sync::Arc;

/// Invalid arguments or configuration
pub const EXIT_USAGE: i32 = 2;
/// Engine or sandbox failure outside the submission itself
pub const EXIT_INFRA: i32 = 3;

pub fn connect(config: &Config) -> anyhow::Result<Arc<DockerEngine>> {
    let engine = DockerEngine::connect(&config.engine).with_context(|| {
        format!(
            "connecting to engine at {}",
            config.engine.host.as_deref().unwrap_or("the local default socket")
        )
    })?;
    Ok(Arc::new(engine))
}
