mod cli;
mod commands;
mod config;
mod output;
mod terminal;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use execgate_core::runtime::ExecRunner;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli)?;
    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => commands::run::run(args, config, cli.format).await,
        Commands::Analyze(args) => {
            commands::analyze::run(args, config, cli.format).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Approvals { command } => {
            commands::approvals::run(command, &config, cli.format).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schema => {
            output::json::print_json(&ExecRunner::parameters_schema())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr, or to a daily rolling file when `--log-dir` is set.
/// `RUST_LOG` overrides the default level.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "execgate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
            Ok(None)
        }
    }
}
