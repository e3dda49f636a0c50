use std::sync::Arc;

use dexsync_core::bridge::{
    spawn_http_replication_worker, ChannelBridge, NoopBridge, ReplicationBridge,
};
use dexsync_core::models::InstanceRecord;
use dexsync_core::BaseData;

use crate::commands::common::{build_patch, build_store, open_durable, Context};
use crate::error::CliError;

pub async fn run_edit(
    key: &str,
    assignments: &[String],
    offline: bool,
    context: &Context,
) -> Result<(), CliError> {
    let record = apply_edit(key, assignments, offline, context).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn apply_edit(
    key: &str,
    assignments: &[String],
    offline: bool,
    context: &Context,
) -> Result<InstanceRecord, CliError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::EmptyInstanceKey);
    }
    let patch = build_patch(assignments)?;

    let durable = open_durable(&context.db_path).await?;
    let identity = context.identity(durable.device_id().await?)?;
    let config = if offline {
        None
    } else {
        Some(context.sync_config()?)
    };

    let (bridge, worker): (Arc<dyn ReplicationBridge>, _) = match &config {
        Some(config) => {
            let (bridge, receiver) = ChannelBridge::new();
            let worker =
                spawn_http_replication_worker(config, identity.access_token.clone(), receiver)?;
            (Arc::new(bridge), Some(worker))
        }
        None => (Arc::new(NoopBridge), None),
    };

    let store = build_store(durable, config.as_ref(), bridge);
    store.init(&identity).await;
    store.load_base(BaseData::default()).await;
    let record = store.apply_local_edit(key, patch).await;

    // Dropping the store closes the queue so the worker drains and exits
    drop(store);
    if let Some(worker) = worker {
        worker.await?;
    }

    record?.ok_or(CliError::EmptyPatch)
}
