use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] dexsync_core::Error),
    #[error(transparent)]
    LibSql(#[from] libsql::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Invalid field assignment '{0}'; expected FIELD=VALUE")]
    InvalidAssignment(String),
    #[error("No fields to change; pass at least one --set FIELD=VALUE")]
    EmptyPatch,
    #[error("Instance key cannot be empty")]
    EmptyInstanceKey,
    #[error("{0} is not set. Pass --{1} or set the {0} environment variable.")]
    MissingIdentity(&'static str, &'static str),
}
