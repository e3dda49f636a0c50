//! Live update channel.
//!
//! A `LiveChannel` keeps at most one server-push connection open, feeds each
//! message to an `UpdateSink`, and reports its state on a watch channel. A
//! supervisor task periodically reopens the channel after it closes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::DeviceId;
use crate::services::OwnershipStore;
use crate::sync::sse::SseDecoder;

const EVENT_BUFFER: usize = 64;

/// Connection state of the live channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
}

/// Event delivered by a transport for an open connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw text payload of one message
    Message(String),
    /// The connection ended, with a reason when one is known
    Closed(Option<String>),
}

/// An open connection: a stream of events plus the task feeding it
#[derive(Debug)]
pub struct LiveSubscription {
    events: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl LiveSubscription {
    pub const fn new(events: mpsc::Receiver<TransportEvent>, reader: Option<JoinHandle<()>>) -> Self {
        Self { events, reader }
    }

    /// Subscription whose events come from an existing channel
    pub const fn from_channel(events: mpsc::Receiver<TransportEvent>) -> Self {
        Self::new(events, None)
    }

    /// Next event, or `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Release the connection.
    pub fn close(&mut self) {
        self.events.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens server-push connections for a device
pub trait LiveTransport: Send + Sync + 'static {
    fn connect(&self, device_id: &DeviceId) -> impl Future<Output = Result<LiveSubscription>> + Send;
}

/// Consumer of live messages
pub trait UpdateSink: Send + Sync + 'static {
    /// Decode and apply one payload. Malformed payloads return
    /// `Error::MalformedPayload` and change nothing.
    fn apply_live_payload(&self, payload: &str) -> impl Future<Output = Result<()>> + Send;

    /// Whether identity, data and checkpoint are all in place
    fn channel_ready(&self) -> bool;
}

impl UpdateSink for OwnershipStore {
    fn apply_live_payload(&self, payload: &str) -> impl Future<Output = Result<()>> + Send {
        self.apply_payload(payload)
    }

    fn channel_ready(&self) -> bool {
        self.readiness().is_ready()
    }
}

/// Server-sent events transport for `GET {events_base_url}/sse`
#[derive(Clone)]
pub struct SseTransport {
    endpoint: String,
    client: reqwest::Client,
    access_token: Option<String>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SseTransport")
            .field("endpoint", &self.endpoint)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    pub fn new(config: &SyncConfig, access_token: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: format!("{}/sse", config.events_base_url),
            client: reqwest::Client::builder().build()?,
            access_token,
        })
    }
}

impl LiveTransport for SseTransport {
    fn connect(&self, device_id: &DeviceId) -> impl Future<Output = Result<LiveSubscription>> + Send {
        let url = format!(
            "{}?device_id={}",
            self.endpoint,
            urlencoding::encode(device_id.as_str())
        );
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        async move {
            let response = request
                .send()
                .await
                .map_err(|error| Error::Network(format!("live channel handshake failed: {error}")))?;
            let status = response.status();
            if !status.is_success() {
                return Err(Error::Network(format!(
                    "live channel handshake rejected: HTTP {}",
                    status.as_u16()
                )));
            }

            let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
            let reader = tokio::spawn(read_event_stream(response, sender));
            Ok(LiveSubscription::new(receiver, Some(reader)))
        }
    }
}

async fn read_event_stream(mut response: reqwest::Response, sender: mpsc::Sender<TransportEvent>) {
    let mut decoder = SseDecoder::default();
    loop {
        let reason = match response.chunk().await {
            Ok(Some(bytes)) => {
                for event in decoder.feed(&bytes) {
                    if !event.is_message() {
                        continue;
                    }
                    if sender.send(TransportEvent::Message(event.data)).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Ok(None) => "stream ended".to_string(),
            Err(error) => error.to_string(),
        };
        let _ = sender.send(TransportEvent::Closed(Some(reason))).await;
        return;
    }
}

struct ActiveConnection {
    generation: u64,
    pump: JoinHandle<()>,
}

struct ChannelInner<T, S> {
    transport: T,
    sink: S,
    device_id: DeviceId,
    handshake_timeout: Option<Duration>,
    state: watch::Sender<ChannelState>,
    active: Mutex<Option<ActiveConnection>>,
    generation: AtomicU64,
}

impl<T, S> ChannelInner<T, S> {
    fn active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Mark the connection of `generation` as gone unless a newer one replaced it.
    fn release(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        let mut active = self.active();
        if active.as_ref().is_some_and(|connection| connection.generation == generation) {
            active.take();
        }
        self.state.send_replace(ChannelState::Closed);
    }
}

/// Single live connection with state reporting.
pub struct LiveChannel<T, S> {
    inner: Arc<ChannelInner<T, S>>,
}

impl<T, S> Clone for LiveChannel<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: LiveTransport, S: UpdateSink> LiveChannel<T, S> {
    pub fn new(transport: T, sink: S, device_id: DeviceId, handshake_timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                sink,
                device_id,
                handshake_timeout,
                state,
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Open a fresh connection, tearing down any existing one first.
    pub async fn open(&self) -> Result<()> {
        self.close_active();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.send_replace(ChannelState::Connecting);
        tracing::info!(device_id = %self.inner.device_id, "Opening live channel");

        let connect = self.inner.transport.connect(&self.inner.device_id);
        let result = match self.inner.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.unwrap_or_else(|_| {
                Err(Error::Network(format!(
                    "live channel handshake timed out after {}s",
                    limit.as_secs()
                )))
            }),
            None => connect.await,
        };

        let subscription = match result {
            Ok(subscription) => subscription,
            Err(error) => {
                tracing::warn!("Live channel failed to open: {error}");
                self.inner.release(generation);
                return Err(error);
            }
        };
        if !self.inner.is_current(generation) {
            tracing::debug!("Discarding live connection superseded during handshake");
            return Ok(());
        }

        self.inner.state.send_replace(ChannelState::Open);
        let pump = tokio::spawn(pump_messages(Arc::clone(&self.inner), generation, subscription));
        *self.inner.active() = Some(ActiveConnection { generation, pump });
        tracing::info!("Live channel open");
        Ok(())
    }

    /// Close the current connection, if any.
    pub fn close(&self) {
        self.close_active();
        self.inner.state.send_replace(ChannelState::Closed);
    }

    fn close_active(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = self.inner.active().take() {
            connection.pump.abort();
            tracing::debug!("Closed previous live connection");
        }
    }

    /// Reopen the channel if it is closed and the sink is ready.
    ///
    /// Returns whether a connection attempt was made.
    pub async fn reconnect_if_needed(&self) -> bool {
        if self.state() != ChannelState::Closed || !self.inner.sink.channel_ready() {
            return false;
        }
        tracing::info!("Live channel closed; reconnecting");
        let _ = self.open().await;
        true
    }

    /// Spawn a task calling `reconnect_if_needed` every `interval`.
    pub fn spawn_supervisor(&self, interval: Duration) -> SupervisorHandle {
        let channel = self.clone();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        channel.reconnect_if_needed().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Reconnect supervisor stopped");
        });

        SupervisorHandle { shutdown, task }
    }
}

async fn pump_messages<T, S: UpdateSink>(
    inner: Arc<ChannelInner<T, S>>,
    generation: u64,
    mut subscription: LiveSubscription,
) {
    loop {
        match subscription.next_event().await {
            Some(TransportEvent::Message(payload)) => {
                match inner.sink.apply_live_payload(&payload).await {
                    Ok(()) => tracing::debug!("Applied live update"),
                    Err(Error::MalformedPayload(reason)) => {
                        tracing::warn!("Dropping malformed live update: {reason}");
                    }
                    Err(error) => tracing::warn!("Failed to apply live update: {error}"),
                }
            }
            Some(TransportEvent::Closed(reason)) => {
                tracing::warn!(
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Live channel closed by transport"
                );
                break;
            }
            None => {
                tracing::warn!("Live channel stream ended");
                break;
            }
        }
    }
    subscription.close();
    inner.release(generation);
}

/// Handle to a running reconnect supervisor
#[derive(Debug)]
pub struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Stop the supervisor. Any reconnect in progress is abandoned.
    pub fn cancel(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}
