use codebox_runtime::{Config, Pipeline};

use super::EXIT_INFRA;

pub async fn run(config: &Config) -> anyhow::Result<i32> {
    let engine = super::connect(config)?;
    let pipeline = Pipeline::new(engine, config);

    if let Err(e) = pipeline
        .prober()
        .wait_ready(config.pipeline.probe_deadline)
        .await
    {
        eprintln!("✗ {}", e);
        return Ok(EXIT_INFRA);
    }

    match pipeline.pool().warm().await {
        Ok(instances) => {
            for instance in &instances {
                println!("✓ {} running", instance.name());
            }
            tracing::info!(count = instances.len(), "Sandbox pool warmed");
            Ok(0)
        }
        Err(e) => {
            eprintln!("✗ {}", e);
            Ok(EXIT_INFRA)
        }
    }
}
