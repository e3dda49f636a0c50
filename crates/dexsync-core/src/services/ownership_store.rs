//! In-memory ownership state mirrored to the durable store.
//!
//! `OwnershipStore` is the only owner of the ownership map. Every mutation
//! (inbound envelopes and local edits) is a synchronous merge under a short
//! lock; persistence happens afterwards and is serialized so the durable copy
//! always ends up at the latest computed map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};

use crate::bridge::{ReplicationBridge, ReplicationRequest};
use crate::merge::{merge, merge_for_owner};
use crate::models::{
    BaseData, Identity, InstanceKey, InstanceRecord, OwnershipMap, TradeBook, UpdateEnvelope,
};
use crate::services::DurableStore;
use crate::session::{unix_millis_now, SessionTracker};
use crate::{Error, Result};

/// Partial record fields keyed by wire name (`is_owned`, `nickname`, ...)
pub type RecordPatch = Map<String, Value>;

/// Which preconditions for opening the live channel currently hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub identity_resolved: bool,
    pub data_loaded: bool,
    pub checkpoint_initialized: bool,
}

impl Readiness {
    pub const fn is_ready(&self) -> bool {
        self.identity_resolved && self.data_loaded && self.checkpoint_initialized
    }
}

#[derive(Default)]
struct StoreState {
    owner: Option<String>,
    data_loaded: bool,
    instances: Arc<OwnershipMap>,
    trades: TradeBook,
    checkpoint: Option<i64>,
    map_version: u64,
    checkpoint_version: u64,
}

impl StoreState {
    fn merge_incoming(&self, incoming: &OwnershipMap) -> OwnershipMap {
        match &self.owner {
            Some(owner) => merge_for_owner(&self.instances, incoming, owner),
            None => merge(&self.instances, incoming),
        }
    }

    fn replace_instances(&mut self, instances: OwnershipMap) {
        self.instances = Arc::new(instances);
        self.map_version += 1;
    }

    fn set_checkpoint(&mut self, checkpoint: i64) {
        self.checkpoint = Some(checkpoint);
        self.checkpoint_version += 1;
    }
}

struct Inner {
    state: Mutex<StoreState>,
    durable: DurableStore,
    session: SessionTracker,
    bridge: Arc<dyn ReplicationBridge>,
    // Last map / checkpoint versions written to the durable store
    map_writes: tokio::sync::Mutex<u64>,
    checkpoint_writes: tokio::sync::Mutex<u64>,
}

/// Shared handle to the ownership state.
#[derive(Clone)]
pub struct OwnershipStore {
    inner: Arc<Inner>,
}

impl OwnershipStore {
    pub fn new(
        durable: DurableStore,
        session: SessionTracker,
        bridge: Arc<dyn ReplicationBridge>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState::default()),
                durable,
                session,
                bridge,
                map_writes: tokio::sync::Mutex::new(0),
                checkpoint_writes: tokio::sync::Mutex::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &SessionTracker {
        &self.inner.session
    }

    /// Bind the store to `identity` and hydrate it from the durable cache.
    ///
    /// Cached records tagged with another account are discarded.
    pub async fn init(&self, identity: &Identity) {
        let cached = match self.inner.durable.load_ownership().await {
            Ok(cached) => cached,
            Err(error) => {
                tracing::warn!("Failed to read cached ownership map: {error}");
                None
            }
        };
        let checkpoint = match self.inner.durable.load_checkpoint().await {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                tracing::warn!("Failed to read sync checkpoint: {error}");
                None
            }
        };

        let mut state = self.state();
        state.owner = Some(identity.username.clone());
        state.trades.clear();
        state.data_loaded = false;
        let cached_count = cached.as_ref().map_or(0, |stored| stored.instances.len());
        let instances = cached.map_or_else(OwnershipMap::new, |stored| {
            merge_for_owner(&OwnershipMap::new(), &stored.instances, &identity.username)
        });
        state.instances = Arc::new(instances);
        state.checkpoint = checkpoint;

        tracing::info!(
            user_id = %identity.user_id,
            cached = cached_count,
            checkpoint = ?checkpoint,
            "Ownership store initialized"
        );
    }

    /// Merge the base loader's full map and mark data as loaded.
    ///
    /// When no checkpoint is stored yet, the base map's fetch time becomes the
    /// checkpoint.
    pub async fn load_base(&self, base: BaseData) {
        {
            let mut state = self.state();
            let merged = state.merge_incoming(&base.instances);
            state.replace_instances(merged);
            if state.checkpoint.is_none() {
                state.set_checkpoint(base.fetched_at);
            }
            state.data_loaded = true;
            tracing::info!(
                records = state.instances.len(),
                checkpoint = ?state.checkpoint,
                "Base ownership data loaded"
            );
        }
        self.persist_map().await;
        self.persist_checkpoint().await;
    }

    /// Unbind the store from the current user, dropping in-memory state only.
    pub fn teardown(&self) {
        let mut state = self.state();
        let map_version = state.map_version;
        let checkpoint_version = state.checkpoint_version;
        *state = StoreState {
            map_version,
            checkpoint_version,
            ..StoreState::default()
        };
        tracing::info!("Ownership store torn down");
    }

    /// Clear in-memory and durable state (logout).
    pub async fn reset_all(&self) {
        // Hold both write locks so no in-flight write lands after the clear
        let mut map_written = self.inner.map_writes.lock().await;
        let mut checkpoint_written = self.inner.checkpoint_writes.lock().await;
        {
            let mut state = self.state();
            let map_version = state.map_version + 1;
            let checkpoint_version = state.checkpoint_version + 1;
            *state = StoreState {
                map_version,
                checkpoint_version,
                ..StoreState::default()
            };
            *map_written = map_version;
            *checkpoint_written = checkpoint_version;
        }

        if let Err(error) = self.inner.durable.clear_user_state().await {
            tracing::warn!("Failed to clear durable ownership state: {error}");
        }
        tracing::info!("Ownership state reset");
    }

    /// Read-only view of the current map.
    pub fn snapshot(&self) -> Arc<OwnershipMap> {
        Arc::clone(&self.state().instances)
    }

    /// Current trades and related instances.
    pub fn trade_book(&self) -> TradeBook {
        self.state().trades.clone()
    }

    pub fn checkpoint(&self) -> Option<i64> {
        self.state().checkpoint
    }

    pub fn readiness(&self) -> Readiness {
        let state = self.state();
        Readiness {
            identity_resolved: state.owner.is_some(),
            data_loaded: state.data_loaded,
            checkpoint_initialized: state.checkpoint.is_some(),
        }
    }

    /// Merge an inbound envelope and advance the checkpoint to `now`.
    ///
    /// An envelope without records only advances the checkpoint.
    pub async fn apply_envelope(&self, envelope: &UpdateEnvelope, now: i64) {
        {
            let mut state = self.state();
            if state.owner.is_none() {
                tracing::debug!("Ignoring update received after teardown");
                return;
            }
            if let Some(incoming) = envelope.instances.as_ref().filter(|map| !map.is_empty()) {
                let merged = state.merge_incoming(incoming);
                state.replace_instances(merged);
            }
            state.trades.apply(envelope);
            state.set_checkpoint(now);
            tracing::debug!(
                incoming = envelope.instances.as_ref().map_or(0, OwnershipMap::len),
                records = state.instances.len(),
                "Applied update envelope"
            );
        }
        self.inner.session.mark_continuing();

        if envelope.has_instances() {
            self.persist_map().await;
        }
        self.persist_checkpoint().await;
    }

    /// Decode a text payload and apply it.
    ///
    /// A malformed payload leaves every piece of state untouched.
    pub async fn apply_payload(&self, payload: &str) -> Result<()> {
        let envelope = UpdateEnvelope::parse(payload)?;
        self.apply_envelope(&envelope, unix_millis_now()).await;
        Ok(())
    }

    /// Apply a user edit to one record.
    ///
    /// Returns the record as stored, or `None` when the patch was empty or
    /// no user is bound.
    pub async fn apply_local_edit(
        &self,
        key: impl Into<InstanceKey>,
        patch: RecordPatch,
    ) -> Result<Option<InstanceRecord>> {
        let key = key.into();
        let mut applied = self
            .apply_local_edits(BTreeMap::from([(key.clone(), patch)]))
            .await?;
        Ok(applied.remove(&key))
    }

    /// Apply several user edits as one batch sharing one timestamp.
    ///
    /// Every patch is validated before anything changes: one patch whose
    /// values do not fit the record fields rejects the whole batch with
    /// `Error::InvalidInput`. The patched records then go through the merge
    /// as one incoming map and are persisted. Only edits that won the merge
    /// are handed to the replication bridge.
    pub async fn apply_local_edits(
        &self,
        patches: BTreeMap<InstanceKey, RecordPatch>,
    ) -> Result<BTreeMap<InstanceKey, InstanceRecord>> {
        let timestamp = unix_millis_now();
        let (applied, winners) = {
            let mut state = self.state();
            if state.owner.is_none() {
                tracing::debug!("Ignoring local edit while no user is bound");
                return Ok(BTreeMap::new());
            }

            let mut incoming = OwnershipMap::new();
            for (key, patch) in patches {
                if patch.is_empty() {
                    continue;
                }
                let current = state.instances.get(&key).cloned().unwrap_or_else(|| {
                    tracing::warn!(key = %key, "Edited record is missing; creating placeholder");
                    InstanceRecord::default()
                });
                let record = current.patched(&patch, timestamp).map_err(|error| {
                    Error::InvalidInput(format!("invalid fields for {key}: {error}"))
                })?;
                incoming.insert(key, record);
            }
            if incoming.is_empty() {
                return Ok(BTreeMap::new());
            }

            let merged = state.merge_incoming(&incoming);
            let applied: BTreeMap<InstanceKey, InstanceRecord> = incoming
                .keys()
                .filter_map(|key| merged.get(key).map(|record| (key.clone(), record.clone())))
                .collect();
            let winners: Vec<InstanceKey> = incoming
                .iter()
                .filter(|(key, record)| applied.get(*key) == Some(*record))
                .map(|(key, _)| key.clone())
                .collect();
            state.replace_instances(merged);
            (applied, winners)
        };

        self.persist_map().await;

        for key in &winners {
            if let Some(record) = applied.get(key) {
                self.inner.bridge.hand_off(ReplicationRequest {
                    key: key.clone(),
                    record: record.clone(),
                    timestamp,
                });
            }
        }
        if winners.len() < applied.len() {
            tracing::debug!(
                superseded = applied.len() - winners.len(),
                "Stored records newer than local edit; not replicating"
            );
        }
        tracing::debug!(edits = applied.len(), "Applied local edits");
        Ok(applied)
    }

    async fn persist_map(&self) {
        let mut written = self.inner.map_writes.lock().await;
        let (version, instances) = {
            let state = self.state();
            (state.map_version, Arc::clone(&state.instances))
        };
        if version <= *written {
            return;
        }

        match self
            .inner
            .durable
            .save_ownership(&instances, unix_millis_now())
            .await
        {
            Ok(()) => *written = version,
            Err(error) => tracing::warn!("Failed to persist ownership map: {error}"),
        }
    }

    async fn persist_checkpoint(&self) {
        let mut written = self.inner.checkpoint_writes.lock().await;
        let (version, checkpoint) = {
            let state = self.state();
            (state.checkpoint_version, state.checkpoint)
        };
        let Some(checkpoint) = checkpoint else {
            return;
        };
        if version <= *written {
            return;
        }

        match self.inner.durable.save_checkpoint(checkpoint).await {
            Ok(()) => *written = version,
            Err(error) => tracing::warn!("Failed to persist sync checkpoint: {error}"),
        }
    }
}
