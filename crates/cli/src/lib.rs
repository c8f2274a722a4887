pub mod commands;

use std::process::ExitCode;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use procure_core::config::{AppConfig, LoadOptions, LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "procure",
    about = "Procure approval engine operator CLI",
    long_about = "Apply approval-engine schema migrations, inspect configuration, and check \
                  runtime readiness.",
    after_help = "Examples:\n  procure migrate\n  procure config\n  procure doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity, and schema currency")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // Config errors are reported by the command itself.
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        if let Err(error) = init_logging(&config.logging) {
            eprintln!("logging disabled: {error}");
        }
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Installs the global subscriber on stderr; stdout carries command output only.
pub fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(&logging.level)
        .map_err(|error| anyhow!("invalid log level `{}`: {error}", logging.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!("failed to install tracing subscriber: {error}"))
}
