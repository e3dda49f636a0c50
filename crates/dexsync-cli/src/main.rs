//! dexsync CLI - inspect, edit and live-sync a local ownership cache

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::Context;
use crate::commands::edit::run_edit;
use crate::commands::reset::run_reset;
use crate::commands::status::run_status;
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "dexsync=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let context = Context::from_cli(&cli);

    match cli.command {
        Commands::Status { json } => run_status(json, &context).await?,
        Commands::Edit {
            key,
            assignments,
            offline,
        } => run_edit(&key, &assignments, offline, &context).await?,
        Commands::Reset => run_reset(&context).await?,
        Commands::Watch => run_watch(&context).await?,
    }

    Ok(())
}
