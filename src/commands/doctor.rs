use std::io::Write;

use codebox_runtime::sandbox::ReadinessProber;
use codebox_runtime::{Config, ExecutionEngine};

use super::EXIT_INFRA;

/// Print a check label and flush it, so it shows while the check runs
fn step(label: std::fmt::Arguments<'_>) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "• {}... ", label)?;
    stdout.flush()
}

pub async fn run(config: &Config) -> anyhow::Result<i32> {
    println!("🔍 Checking sandbox host...\n");

    let mut all_ok = true;

    step(format_args!("Connecting to engine"))?;
    let engine = match super::connect(config) {
        Ok(engine) => {
            println!("✓ Client configured");
            engine
        }
        Err(e) => {
            println!("✗ {:#}", e);
            return Ok(EXIT_INFRA);
        }
    };

    step(format_args!("Waiting for engine"))?;
    let prober = ReadinessProber::new(engine.clone(), config.pipeline.probe_interval);
    match prober.wait_ready(config.pipeline.probe_deadline).await {
        Ok(()) => println!("✓ Engine is answering"),
        Err(e) => {
            println!("✗ {}", e);
            println!("  Is the Docker daemon running and reachable?");
            return Ok(EXIT_INFRA);
        }
    }

    step(format_args!("Checking image {}", config.engine.image))?;
    match engine.pull_image(&config.engine.image).await {
        Ok(()) => println!("✓ Image available"),
        Err(e) => {
            println!("⚠️  Pull failed, a cached copy will be used if present: {}", e);
        }
    }

    for index in 0..config.sandbox.pool_size {
        let name = format!("{}-{}", config.sandbox.name_prefix, index);
        step(format_args!("Checking sandbox {}", name))?;
        match engine.inspect_instance(&name).await {
            Ok(Some(state)) if state.running => println!("✓ Running"),
            Ok(Some(_)) => println!("○ Stopped (started on next submission)"),
            Ok(None) => println!("○ Not created yet (run: codebox warm)"),
            Err(e) => {
                println!("✗ {}", e);
                all_ok = false;
            }
        }
    }

    println!(
        "• Online restore fallback: {}",
        if config.pipeline.online_restore {
            "enabled"
        } else {
            "disabled"
        }
    );

    println!();
    if all_ok {
        println!("✅ All checks passed");
        Ok(0)
    } else {
        println!("⚠️  Some checks failed");
        Ok(EXIT_INFRA)
    }
}
