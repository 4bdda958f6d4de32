use clap::{Arg, ArgAction, ArgMatches, Command};
use codebox_runtime::{Config, LogFormat};

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn cli() -> Command {
    Command::new("codebox")
        .version(VERSION)
        .about("Compile and run untrusted C# snippets in isolated containers")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("TOML configuration file; environment variables still override it"),
        )
        .subcommand(
            Command::new("run")
                .about("Build and run one submission, printing the outcome as JSON")
                .arg(
                    Arg::new("file")
                        .short('f')
                        .long("file")
                        .value_name("PATH")
                        .conflicts_with("code")
                        .help("Read the C# source from a file ('-' for stdin)"),
                )
                .arg(
                    Arg::new("code")
                        .long("code")
                        .value_name("TEXT")
                        .help("C# source given inline"),
                )
                .arg(
                    Arg::new("pretty")
                        .long("pretty")
                        .action(ArgAction::SetTrue)
                        .help("Pretty-print the JSON outcome"),
                ),
        )
        .subcommand(Command::new("doctor").about("Check that the execution engine is reachable"))
        .subcommand(Command::new("warm").about("Provision every sandbox in the pool ahead of time"))
}

fn config_path(matches: &ArgMatches) -> Option<&String> {
    matches.get_one::<String>("config").or_else(|| {
        matches
            .subcommand()
            .and_then(|(_, sub_matches)| sub_matches.get_one::<String>("config"))
    })
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let config = match config_path(matches) {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env()?;
            config
        }
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

/// Logs go to stderr so `run` can keep stdout for the JSON outcome
fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("codebox: invalid configuration: {:#}", e);
            std::process::exit(commands::EXIT_USAGE);
        }
    };
    init_logging(&config);

    let result = match matches.subcommand() {
        Some(("run", sub_matches)) => commands::run::run(sub_matches, &config).await,
        Some(("doctor", _)) => commands::doctor::run(&config).await,
        Some(("warm", _)) => commands::warm::run(&config).await,
        _ => {
            println!("codebox v{}", VERSION);
            println!("Use --help for available commands");
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("codebox: {:#}", e);
            std::process::exit(commands::EXIT_INFRA);
        }
    }
}
