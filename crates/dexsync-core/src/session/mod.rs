//! Session tracking.
//!
//! A session is "new" when the app was out of the foreground for longer than
//! the inactivity threshold. New sessions trigger a catch-up fetch before the
//! live channel opens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::services::DurableStore;

/// Default gap in foreground activity after which a session counts as new.
pub const DEFAULT_INACTIVITY_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Current wall-clock time in Unix ms.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of one session evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvaluation {
    pub is_new: bool,
}

/// Decide whether the activation at `now` starts a new session.
///
/// All times are Unix ms. A missing `last_activity_time` always means new.
pub fn evaluate_session(
    now: i64,
    last_activity_time: Option<i64>,
    inactivity_threshold: Duration,
) -> SessionEvaluation {
    let threshold = i64::try_from(inactivity_threshold.as_millis()).unwrap_or(i64::MAX);
    let is_new = last_activity_time.is_none_or(|last| now.saturating_sub(last) > threshold);
    SessionEvaluation { is_new }
}

/// Session state with the last activity time persisted in the durable store.
///
/// `is_session_new` lives in memory only.
#[derive(Clone)]
pub struct SessionTracker {
    durable: DurableStore,
    inactivity_threshold: Duration,
    is_new: Arc<AtomicBool>,
}

impl SessionTracker {
    pub fn new(durable: DurableStore, inactivity_threshold: Duration) -> Self {
        Self {
            durable,
            inactivity_threshold,
            is_new: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Evaluate the session at `now` and record `now` as the last activity.
    ///
    /// Called on activation and on every return to the foreground. Storage
    /// failures degrade to "new session".
    pub async fn evaluate(&self, now: i64) -> SessionEvaluation {
        let last_activity = match self.durable.load_last_activity().await {
            Ok(last_activity) => last_activity,
            Err(error) => {
                tracing::warn!("Failed to read last activity time: {error}");
                None
            }
        };

        let evaluation = evaluate_session(now, last_activity, self.inactivity_threshold);
        self.is_new.store(evaluation.is_new, Ordering::SeqCst);

        if let Err(error) = self.durable.save_last_activity(now).await {
            tracing::warn!("Failed to record last activity time: {error}");
        }

        tracing::debug!(
            is_new = evaluation.is_new,
            last_activity = ?last_activity,
            "Evaluated session"
        );
        evaluation
    }

    /// Whether the current activation follows an inactivity gap.
    pub fn is_session_new(&self) -> bool {
        self.is_new.load(Ordering::SeqCst)
    }

    /// Mark the session as continuing once an update has been applied.
    pub fn mark_continuing(&self) {
        if self.is_new.swap(false, Ordering::SeqCst) {
            tracing::debug!("Session is now continuing");
        }
    }
}
