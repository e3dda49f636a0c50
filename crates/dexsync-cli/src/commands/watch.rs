use std::sync::Arc;

use dexsync_core::bridge::{spawn_http_replication_worker, ChannelBridge};
use dexsync_core::sync::{HttpCatchUpClient, SseTransport};
use dexsync_core::{BaseData, SyncEngine};

use crate::commands::common::{
    build_store, describe_channel_state, format_activation_lines, open_durable, Context,
};
use crate::error::CliError;

pub async fn run_watch(context: &Context) -> Result<(), CliError> {
    let config = context.sync_config()?;
    let durable = open_durable(&context.db_path).await?;
    let identity = context.identity(durable.device_id().await?)?;
    let token = identity.access_token.clone();

    let (bridge, receiver) = ChannelBridge::new();
    let worker = spawn_http_replication_worker(&config, token.clone(), receiver)?;
    let store = build_store(durable, Some(&config), Arc::new(bridge));
    let engine = SyncEngine::new(
        config.clone(),
        identity,
        store,
        HttpCatchUpClient::new(&config, token.clone())?,
        SseTransport::new(&config, token)?,
    );

    // First install: the catch-up since 0 pulls the full map
    let report = engine.activate(BaseData::default()).await;
    for line in format_activation_lines(&report) {
        println!("{line}");
    }
    println!("{} records cached; press Ctrl-C to stop", engine.store().snapshot().len());

    let mut states = engine.channel().subscribe_state();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!(
                    "live channel {} ({} records)",
                    describe_channel_state(state),
                    engine.store().snapshot().len()
                );
            }
        }
    }

    engine.teardown();
    worker.abort();
    println!("Stopped");
    Ok(())
}
