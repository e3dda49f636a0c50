//! Scripted transports and sinks for sync tests.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::error::{Error, Result};
use crate::models::{DeviceId, UpdateEnvelope};
use crate::sync::catch_up::CatchUpSource;
use crate::sync::live::{LiveSubscription, LiveTransport, TransportEvent, UpdateSink};

/// Outcome of one scripted connection attempt
pub enum Step {
    Accept(mpsc::Receiver<TransportEvent>),
    Fail,
    Hang,
}

impl Step {
    /// An accepted connection and the sender that drives it.
    pub fn accept() -> (mpsc::Sender<TransportEvent>, Self) {
        let (sender, receiver) = mpsc::channel(16);
        (sender, Self::Accept(receiver))
    }
}

/// Transport replaying queued steps; an empty queue hangs
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    attempts: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<Step>>>,
}

impl ScriptedTransport {
    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl LiveTransport for ScriptedTransport {
    fn connect(&self, _device_id: &DeviceId) -> impl Future<Output = Result<LiveSubscription>> + Send {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Hang);
        async move {
            match step {
                Step::Accept(receiver) => Ok(LiveSubscription::from_channel(receiver)),
                Step::Fail => Err(Error::Network("connection refused".to_string())),
                Step::Hang => std::future::pending().await,
            }
        }
    }
}

/// Sink recording whether each payload parsed
#[derive(Clone, Default)]
pub struct RecordingSink {
    ready: Arc<AtomicBool>,
    results: Arc<Mutex<Vec<bool>>>,
    applied: Arc<Notify>,
}

impl RecordingSink {
    pub fn ready() -> Self {
        let sink = Self::default();
        sink.set_ready(true);
        sink
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Wait until `count` payloads were seen and return their outcomes.
    pub async fn wait_for(&self, count: usize) -> Vec<bool> {
        loop {
            {
                let results = self.results.lock().unwrap();
                if results.len() >= count {
                    return results.clone();
                }
            }
            self.applied.notified().await;
        }
    }
}

impl UpdateSink for RecordingSink {
    fn apply_live_payload(&self, payload: &str) -> impl Future<Output = Result<()>> + Send {
        let result = UpdateEnvelope::parse(payload).map(|_| ());
        self.results.lock().unwrap().push(result.is_ok());
        self.applied.notify_one();
        std::future::ready(result)
    }

    fn channel_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Canned catch-up response
#[derive(Clone)]
pub enum Reply {
    Envelope(UpdateEnvelope),
    Nothing,
    Fail,
}

/// Catch-up source returning one canned reply and recording checkpoints
#[derive(Clone)]
pub struct ScriptedCatchUp {
    reply: Reply,
    calls: Arc<Mutex<Vec<i64>>>,
}

impl ScriptedCatchUp {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: Arc::default(),
        }
    }

    /// Checkpoints passed to each fetch
    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }
}

impl CatchUpSource for ScriptedCatchUp {
    fn fetch_missed(
        &self,
        _user_id: &str,
        _device_id: &DeviceId,
        since: i64,
    ) -> impl Future<Output = Result<Option<UpdateEnvelope>>> + Send {
        self.calls.lock().unwrap().push(since);
        let result = match &self.reply {
            Reply::Envelope(envelope) => Ok(Some(envelope.clone())),
            Reply::Nothing => Ok(None),
            Reply::Fail => Err(Error::Network("catch-up unavailable".to_string())),
        };
        std::future::ready(result)
    }
}
