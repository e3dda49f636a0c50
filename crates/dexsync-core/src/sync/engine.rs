//! Activation flow tying the store, catch-up fetch and live channel together.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::SyncConfig;
use crate::error::Error;
use crate::models::{BaseData, Identity, UpdateEnvelope};
use crate::services::OwnershipStore;
use crate::session::unix_millis_now;
use crate::sync::catch_up::CatchUpSource;
use crate::sync::live::{ChannelState, LiveChannel, LiveTransport, SupervisorHandle};

/// Result of the catch-up step of an activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// Session was continuing or no checkpoint existed
    Skipped,
    /// Nothing newer on the server; checkpoint advanced
    Empty,
    /// Missed records merged
    Applied { records: usize },
    /// Fetch failed; checkpoint untouched
    Failed(String),
}

/// What one activation did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub session_new: bool,
    pub catch_up: CatchUpOutcome,
    pub channel: ChannelState,
}

/// Sync lifecycle for one signed-in identity.
pub struct SyncEngine<C, T> {
    config: SyncConfig,
    identity: Identity,
    store: OwnershipStore,
    catch_up: C,
    channel: LiveChannel<T, OwnershipStore>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl<C: CatchUpSource, T: LiveTransport> SyncEngine<C, T> {
    pub fn new(
        config: SyncConfig,
        identity: Identity,
        store: OwnershipStore,
        catch_up: C,
        transport: T,
    ) -> Self {
        let channel = LiveChannel::new(
            transport,
            store.clone(),
            identity.device_id.clone(),
            config.handshake_timeout(),
        );
        Self {
            config,
            identity,
            store,
            catch_up,
            channel,
            supervisor: Mutex::new(None),
        }
    }

    pub const fn store(&self) -> &OwnershipStore {
        &self.store
    }

    pub const fn channel(&self) -> &LiveChannel<T, OwnershipStore> {
        &self.channel
    }

    fn supervisor(&self) -> MutexGuard<'_, Option<SupervisorHandle>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the activation flow.
    ///
    /// Hydrates the store, evaluates the session, runs the catch-up fetch for
    /// new sessions, opens the live channel and starts the reconnect
    /// supervisor. Failures degrade to cached data and are only logged.
    pub async fn activate(&self, base: BaseData) -> ActivationReport {
        tracing::info!(user_id = %self.identity.user_id, "Activating sync");
        self.store.init(&self.identity).await;
        self.store.load_base(base).await;

        let evaluation = self.store.session().evaluate(unix_millis_now()).await;
        let catch_up = if evaluation.is_new {
            self.catch_up_if_possible().await
        } else {
            CatchUpOutcome::Skipped
        };

        if self.store.readiness().is_ready() {
            if let Err(error) = self.channel.open().await {
                tracing::warn!("Live channel unavailable; supervisor will retry: {error}");
            }
        } else {
            tracing::warn!("Sync preconditions not met; live channel deferred");
        }

        let supervisor = self.channel.spawn_supervisor(self.config.reconnect_interval());
        if let Some(previous) = self.supervisor().replace(supervisor) {
            previous.cancel();
        }

        ActivationReport {
            session_new: evaluation.is_new,
            catch_up,
            channel: self.channel.state(),
        }
    }

    /// Re-evaluate the session when the app returns to the foreground.
    ///
    /// After an inactivity gap this catches up and reopens the channel
    /// right away instead of waiting for the supervisor.
    pub async fn on_foreground(&self) -> ActivationReport {
        let evaluation = self.store.session().evaluate(unix_millis_now()).await;
        let catch_up = if evaluation.is_new {
            let outcome = self.catch_up_if_possible().await;
            self.channel.reconnect_if_needed().await;
            outcome
        } else {
            CatchUpOutcome::Skipped
        };

        ActivationReport {
            session_new: evaluation.is_new,
            catch_up,
            channel: self.channel.state(),
        }
    }

    async fn catch_up_if_possible(&self) -> CatchUpOutcome {
        let Some(since) = self.store.checkpoint() else {
            tracing::debug!("No checkpoint yet; skipping catch-up");
            return CatchUpOutcome::Skipped;
        };

        let fetch = self
            .catch_up
            .fetch_missed(&self.identity.user_id, &self.identity.device_id, since);
        let result = match self.config.catch_up_timeout() {
            Some(limit) => tokio::time::timeout(limit, fetch).await.unwrap_or_else(|_| {
                Err(Error::Network(format!(
                    "catch-up timed out after {}s",
                    limit.as_secs()
                )))
            }),
            None => fetch.await,
        };

        match result {
            Ok(Some(envelope)) => {
                let records = envelope.instances.as_ref().map_or(0, |map| map.len());
                self.store.apply_envelope(&envelope, unix_millis_now()).await;
                tracing::info!(since, records, "Caught up on missed updates");
                CatchUpOutcome::Applied { records }
            }
            Ok(None) => {
                self.store
                    .apply_envelope(&UpdateEnvelope::default(), unix_millis_now())
                    .await;
                tracing::info!(since, "No missed updates");
                CatchUpOutcome::Empty
            }
            Err(error) => {
                if error.is_transient() {
                    tracing::warn!(since, "Catch-up failed; continuing with cached data: {error}");
                } else {
                    tracing::error!(since, "Catch-up failed; continuing with cached data: {error}");
                }
                CatchUpOutcome::Failed(error.to_string())
            }
        }
    }

    /// Stop the supervisor, close the channel and unbind the store.
    pub fn teardown(&self) {
        if let Some(supervisor) = self.supervisor().take() {
            supervisor.cancel();
        }
        self.channel.close();
        self.store.teardown();
        tracing::info!(user_id = %self.identity.user_id, "Sync torn down");
    }

    /// Tear down and clear every piece of user state.
    pub async fn logout(&self) {
        self.teardown();
        self.store.reset_all().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::NoopBridge;
    use crate::models::{DeviceId, InstanceKey, InstanceRecord, OwnershipMap};
    use crate::services::DurableStore;
    use crate::session::{SessionTracker, DEFAULT_INACTIVITY_THRESHOLD};
    use crate::sync::testing::{Reply, ScriptedCatchUp, ScriptedTransport, Step};
    use pretty_assertions::assert_eq;

    type TestEngine = SyncEngine<ScriptedCatchUp, ScriptedTransport>;

    fn identity() -> Identity {
        Identity::new("u1", "ash", DeviceId::new("dev-1"))
    }

    fn owned(last_update: i64) -> InstanceRecord {
        let mut record = InstanceRecord::new(last_update);
        record.flags.is_owned = true;
        record
    }

    async fn engine(
        durable: &DurableStore,
        reply: Reply,
        transport: &ScriptedTransport,
    ) -> (TestEngine, ScriptedCatchUp) {
        let session = SessionTracker::new(durable.clone(), DEFAULT_INACTIVITY_THRESHOLD);
        let store = OwnershipStore::new(durable.clone(), session, Arc::new(NoopBridge));
        let catch_up = ScriptedCatchUp::new(reply);
        let config = SyncConfig::new("http://127.0.0.1:9", "http://127.0.0.1:9").unwrap();
        (
            SyncEngine::new(config, identity(), store, catch_up.clone(), transport.clone()),
            catch_up,
        )
    }

    fn accepting_transport() -> (ScriptedTransport, tokio::sync::mpsc::Sender<crate::sync::TransportEvent>) {
        let transport = ScriptedTransport::default();
        let (sender, step) = Step::accept();
        transport.push(step);
        (transport, sender)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_session_catches_up_before_opening_channel() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        durable.save_checkpoint(1_000).await.unwrap();
        let missed = UpdateEnvelope::with_instances(OwnershipMap::from([(
            InstanceKey::from("025_pika_1"),
            owned(1_500),
        )]));
        let (transport, _sender) = accepting_transport();
        let (engine, catch_up) = engine(&durable, Reply::Envelope(missed), &transport).await;

        let report = engine.activate(BaseData::default()).await;

        assert!(report.session_new);
        assert_eq!(report.catch_up, CatchUpOutcome::Applied { records: 1 });
        assert_eq!(report.channel, ChannelState::Open);
        assert_eq!(catch_up.calls(), vec![1_000]);
        assert!(engine.store().snapshot().contains_key("025_pika_1"));
        assert!(engine.store().checkpoint().unwrap() > 1_000);
        assert!(!engine.store().session().is_session_new());
        engine.teardown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn continuing_session_skips_catch_up() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        durable.save_checkpoint(1_000).await.unwrap();
        durable.save_last_activity(unix_millis_now()).await.unwrap();
        let (transport, _sender) = accepting_transport();
        let (engine, catch_up) = engine(&durable, Reply::Nothing, &transport).await;

        let report = engine.activate(BaseData::default()).await;

        assert!(!report.session_new);
        assert_eq!(report.catch_up, CatchUpOutcome::Skipped);
        assert!(catch_up.calls().is_empty());
        assert_eq!(engine.store().checkpoint(), Some(1_000));
        assert_eq!(transport.attempts(), 1);
        engine.teardown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_catch_up_advances_checkpoint_only() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        durable.save_checkpoint(1_000).await.unwrap();
        let (transport, _sender) = accepting_transport();
        let (engine, _catch_up) = engine(&durable, Reply::Nothing, &transport).await;
        let base = BaseData {
            instances: OwnershipMap::from([(InstanceKey::from("025_pika_1"), owned(5))]),
            fetched_at: 500,
        };

        let report = engine.activate(base).await;

        assert_eq!(report.catch_up, CatchUpOutcome::Empty);
        assert_eq!(engine.store().snapshot().len(), 1);
        let checkpoint = engine.store().checkpoint().unwrap();
        assert!(checkpoint > 1_000);
        assert_eq!(durable.load_checkpoint().await.unwrap(), Some(checkpoint));
        engine.teardown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_catch_up_keeps_checkpoint_and_still_opens_channel() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        durable.save_checkpoint(1_000).await.unwrap();
        let (transport, _sender) = accepting_transport();
        let (engine, _catch_up) = engine(&durable, Reply::Fail, &transport).await;

        let report = engine.activate(BaseData::default()).await;

        assert!(matches!(report.catch_up, CatchUpOutcome::Failed(_)));
        assert_eq!(report.channel, ChannelState::Open);
        assert_eq!(engine.store().checkpoint(), Some(1_000));
        assert_eq!(durable.load_checkpoint().await.unwrap(), Some(1_000));
        engine.teardown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_messages_flow_into_store() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        let (transport, sender) = accepting_transport();
        let (engine, _catch_up) = engine(&durable, Reply::Nothing, &transport).await;
        engine.activate(BaseData::default()).await;

        sender
            .send(crate::sync::TransportEvent::Message(
                r#"{"pokemon":{"025_pika_1":{"is_owned":true,"last_update":9}}}"#.to_string(),
            ))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !engine.store().snapshot().contains_key("025_pika_1") {
            assert!(tokio::time::Instant::now() < deadline, "live update never applied");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        engine.teardown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn teardown_closes_channel_and_unbinds_store() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        let (transport, sender) = accepting_transport();
        let (engine, _catch_up) = engine(&durable, Reply::Nothing, &transport).await;
        engine.activate(BaseData::default()).await;

        engine.teardown();

        sender.closed().await;
        assert_eq!(engine.channel().state(), ChannelState::Closed);
        assert!(!engine.store().readiness().is_ready());
        assert!(durable.load_checkpoint().await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logout_clears_durable_state() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        let (transport, _sender) = accepting_transport();
        let (engine, _catch_up) = engine(&durable, Reply::Nothing, &transport).await;
        engine
            .activate(BaseData {
                instances: OwnershipMap::from([(InstanceKey::from("025_pika_1"), owned(5))]),
                fetched_at: 10,
            })
            .await;

        engine.logout().await;

        assert_eq!(durable.load_ownership().await.unwrap(), None);
        assert_eq!(durable.load_checkpoint().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn foreground_after_recent_activity_is_continuing() {
        let durable = DurableStore::open_in_memory().await.unwrap();
        let (transport, _sender) = accepting_transport();
        let (engine, catch_up) = engine(&durable, Reply::Nothing, &transport).await;
        engine.activate(BaseData::default()).await;
        let calls_after_activation = catch_up.calls().len();

        let report = engine.on_foreground().await;

        assert!(!report.session_new);
        assert_eq!(report.catch_up, CatchUpOutcome::Skipped);
        assert_eq!(catch_up.calls().len(), calls_after_activation);
        engine.teardown();
    }
}
