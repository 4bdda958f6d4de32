use anyhow::Context;
use clap::ArgMatches;
use codebox_runtime::{Config, Pipeline};
use std::io::Read;

use super::EXIT_USAGE;

fn read_source(matches: &ArgMatches) -> anyhow::Result<Option<String>> {
    if let Some(code) = matches.get_one::<String>("code") {
        return Ok(Some(code.clone()));
    }

    match matches.get_one::<String>("file").map(String::as_str) {
        Some("-") => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("reading source from stdin")?;
            Ok(Some(code))
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading source file {}", path))
            .map(Some),
        None => Ok(None),
    }
}

pub async fn run(matches: &ArgMatches, config: &Config) -> anyhow::Result<i32> {
    let Some(code) = read_source(matches)? else {
        eprintln!("Either --file or --code must be provided for the run command");
        return Ok(EXIT_USAGE);
    };

    let engine = super::connect(config)?;
    let pipeline = Pipeline::new(engine, config);
    let outcome = pipeline.submit(&code).await;

    let json = if matches.get_flag("pretty") {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string(&outcome)?
    };
    println!("{}", json);

    Ok(outcome.exit_status())
}
