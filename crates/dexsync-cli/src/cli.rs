use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dexsync")]
#[command(about = "Keep a local copy of your collection in sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Sync config JSON file (defaults to DEXSYNC_* environment variables)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Account id used for catch-up requests
    #[arg(long, global = true, value_name = "ID")]
    pub user_id: Option<String>,

    /// Account username owning the records
    #[arg(long, global = true, value_name = "NAME")]
    pub username: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the cached ownership map and sync bookkeeping
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit one instance record locally and replicate it
    Edit {
        /// Instance key, e.g. 0025_default_<uuid>
        key: String,
        /// Field assignment; VALUE is parsed as JSON, else taken as text
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        assignments: Vec<String>,
        /// Keep the edit local instead of sending it to the API
        #[arg(long)]
        offline: bool,
    },
    /// Clear the cached map, checkpoint and activity time
    Reset,
    /// Activate sync and stream live updates until interrupted
    Watch,
}
