//! `coordinatord` — the command-line entry point for the multi-agent
//! coordinator (§6).
//!
//! Every subcommand prints one JSON envelope and exits with the code its
//! decision maps to (§7); `start` is the exception, running in the
//! foreground until signalled.

mod cli;
mod commands;
mod config_overlay;
mod output;
mod pidfile;

use clap::Parser;
use cli::{Cli, Command};
use coordinator_core::config::Config;
use coordinator_core::Context;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        if let Err(err) = config_overlay::apply(path) {
            return output::usage_error(err.to_string());
        }
    }

    // `plan` validates a document entirely offline, and `stop` only needs
    // the pidfile — neither needs a Persistence Gateway connection.
    match &cli.command {
        Command::Plan { path } => return commands::plan::run(path),
        Command::Stop => return commands::stop::run(),
        _ => {}
    }

    let config = Config::from_env();
    let ctx = match Context::build(config).await {
        Ok(ctx) => ctx,
        Err(err) => return output::from_error(&err),
    };

    match cli.command {
        Command::Start { cleanup_interval_secs } => match commands::start::run(ctx, cleanup_interval_secs).await {
            Ok(code) => code,
            Err(err) => output::usage_error(err.to_string()),
        },
        Command::Locks { holder } => commands::locks::run(&ctx, holder).await,
        Command::Queue { max_priority, limit } => commands::queue::run(&ctx, max_priority, limit).await,
        Command::Cleanup { staleness_secs } => commands::cleanup::run(&ctx, staleness_secs).await,
        Command::Plan { .. } | Command::Stop => unreachable!("handled above"),
    }
}
