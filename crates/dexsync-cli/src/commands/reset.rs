use std::sync::Arc;

use dexsync_core::bridge::NoopBridge;

use crate::commands::common::{build_store, open_durable, Context};
use crate::error::CliError;

pub async fn run_reset(context: &Context) -> Result<(), CliError> {
    let durable = open_durable(&context.db_path).await?;
    let store = build_store(durable, None, Arc::new(NoopBridge));
    store.reset_all().await;
    println!("Cleared local ownership state in {}", context.db_path.display());
    Ok(())
}
