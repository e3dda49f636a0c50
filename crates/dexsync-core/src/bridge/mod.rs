//! Background replication bridge.
//!
//! Local edits are handed off here for eventual delivery to the server. The
//! handoff is fire-and-forget: the ownership store never awaits delivery.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::models::{InstanceKey, InstanceRecord};
use crate::http_error::describe_failure;

/// One locally edited record awaiting replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub key: InstanceKey,
    pub record: InstanceRecord,
    /// Edit time (Unix ms)
    pub timestamp: i64,
}

/// Receiver side of the local edit handoff
pub trait ReplicationBridge: Send + Sync {
    /// Queue `request` for delivery. Must not block.
    fn hand_off(&self, request: ReplicationRequest);
}

/// Bridge that drops every request (local-only mode)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBridge;

impl ReplicationBridge for NoopBridge {
    fn hand_off(&self, request: ReplicationRequest) {
        tracing::debug!(key = %request.key, "Replication disabled; keeping edit local");
    }
}

/// Bridge backed by an unbounded queue consumed by a background worker
#[derive(Debug, Clone)]
pub struct ChannelBridge {
    sender: mpsc::UnboundedSender<ReplicationRequest>,
}

impl ChannelBridge {
    /// Create a bridge and the receiving end for the worker.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReplicationRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ReplicationBridge for ChannelBridge {
    fn hand_off(&self, request: ReplicationRequest) {
        let key = request.key.clone();
        if self.sender.send(request).is_err() {
            tracing::warn!(key = %key, "Replication worker has stopped; edit stays local");
        }
    }
}

/// Spawn a worker that posts queued edits to `{api_base_url}/batchedUpdates`.
///
/// Delivery failures are logged and the request is dropped; the next catch-up
/// or live update reconciles the server's view.
pub fn spawn_http_replication_worker(
    config: &SyncConfig,
    access_token: Option<String>,
    mut receiver: mpsc::UnboundedReceiver<ReplicationRequest>,
) -> crate::Result<tokio::task::JoinHandle<()>> {
    let endpoint = format!("{}/batchedUpdates", config.api_base_url);
    let client = reqwest::Client::builder().build()?;

    Ok(tokio::spawn(async move {
        while let Some(request) = receiver.recv().await {
            let mut builder = client
                .post(&endpoint)
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&request);
            if let Some(token) = &access_token {
                builder = builder.bearer_auth(token);
            }

            match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(key = %request.key, "Replicated local edit");
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(
                        key = %request.key,
                        "Replication rejected: {}",
                        describe_failure(status, &body)
                    );
                }
                Err(error) => {
                    tracing::warn!(key = %request.key, "Replication request failed: {error}");
                }
            }
        }
        tracing::debug!("Replication worker stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str) -> ReplicationRequest {
        ReplicationRequest {
            key: InstanceKey::from(key),
            record: InstanceRecord::new(1),
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn channel_bridge_forwards_requests() {
        let (bridge, mut receiver) = ChannelBridge::new();
        bridge.hand_off(request("025_pika_1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.key.as_str(), "025_pika_1");
    }

    #[test]
    fn channel_bridge_survives_stopped_worker() {
        let (bridge, receiver) = ChannelBridge::new();
        drop(receiver);
        bridge.hand_off(request("025_pika_1"));
    }
}
