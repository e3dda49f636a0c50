//! Client sync configuration.
//!
//! Provides `SyncConfig`, the endpoints and timings the sync engine needs,
//! loaded from a JSON document or from `DEXSYNC_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_INACTIVITY_THRESHOLD_SECS: u64 = 30 * 60;
const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 30;

pub const ENV_EVENTS_URL: &str = "DEXSYNC_EVENTS_URL";
pub const ENV_API_URL: &str = "DEXSYNC_API_URL";
pub const ENV_INACTIVITY_SECS: &str = "DEXSYNC_INACTIVITY_SECS";
pub const ENV_RECONNECT_SECS: &str = "DEXSYNC_RECONNECT_SECS";
pub const ENV_CATCH_UP_TIMEOUT_SECS: &str = "DEXSYNC_CATCH_UP_TIMEOUT_SECS";
pub const ENV_HANDSHAKE_TIMEOUT_SECS: &str = "DEXSYNC_HANDSHAKE_TIMEOUT_SECS";

/// Endpoints and timings for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Base URL of the events service (catch-up and live channel)
    pub events_base_url: String,
    /// Base URL of the API receiving replicated local edits
    pub api_base_url: String,
    #[serde(default = "default_inactivity_threshold_secs")]
    pub inactivity_threshold_secs: u64,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Upper bound for the catch-up request; unbounded when unset
    #[serde(default)]
    pub catch_up_timeout_secs: Option<u64>,
    /// Upper bound for the live channel handshake; unbounded when unset
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
}

const fn default_inactivity_threshold_secs() -> u64 {
    DEFAULT_INACTIVITY_THRESHOLD_SECS
}

const fn default_reconnect_interval_secs() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_SECS
}

impl SyncConfig {
    /// Build a config with default timings for the given endpoints.
    pub fn new(events_base_url: impl Into<String>, api_base_url: impl Into<String>) -> Result<Self> {
        Self {
            events_base_url: events_base_url.into(),
            api_base_url: api_base_url.into(),
            inactivity_threshold_secs: DEFAULT_INACTIVITY_THRESHOLD_SECS,
            reconnect_interval_secs: DEFAULT_RECONNECT_INTERVAL_SECS,
            catch_up_timeout_secs: None,
            handshake_timeout_secs: None,
        }
        .validated()
    }

    /// Load from `DEXSYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |name: &str| {
            lookup(name)
                .as_deref()
                .and_then(non_blank)
                .ok_or_else(|| Error::Config(format!("{name} is not set")))
        };
        let seconds = |name: &str| -> Result<Option<u64>> {
            lookup(name)
                .as_deref()
                .and_then(non_blank)
                .map(|raw| {
                    raw.parse()
                        .map_err(|_| Error::Config(format!("{name} must be a number of seconds")))
                })
                .transpose()
        };

        Self {
            events_base_url: required(ENV_EVENTS_URL)?,
            api_base_url: required(ENV_API_URL)?,
            inactivity_threshold_secs: seconds(ENV_INACTIVITY_SECS)?
                .unwrap_or(DEFAULT_INACTIVITY_THRESHOLD_SECS),
            reconnect_interval_secs: seconds(ENV_RECONNECT_SECS)?
                .unwrap_or(DEFAULT_RECONNECT_INTERVAL_SECS),
            catch_up_timeout_secs: seconds(ENV_CATCH_UP_TIMEOUT_SECS)?,
            handshake_timeout_secs: seconds(ENV_HANDSHAKE_TIMEOUT_SECS)?,
        }
        .validated()
    }

    pub const fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }

    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn catch_up_timeout(&self) -> Option<Duration> {
        self.catch_up_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    fn validated(mut self) -> Result<Self> {
        self.events_base_url = normalize_base_url(&self.events_base_url, "events_base_url")?;
        self.api_base_url = normalize_base_url(&self.api_base_url, "api_base_url")?;
        if self.reconnect_interval_secs == 0 {
            return Err(Error::Config(
                "reconnect_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Parse a sync config from a raw JSON payload.
pub fn parse_sync_config(payload: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_json::from_str(payload)
        .map_err(|error| Error::Config(format!("invalid sync config JSON: {error}")))?;
    config.validated()
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn normalize_base_url(raw: &str, field: &str) -> Result<String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(Error::Config(format!("config field '{field}' is required")));
    }
    let lowered = value.to_ascii_lowercase();
    if !lowered.starts_with("http://") && !lowered.starts_with("https://") {
        return Err(Error::Config(format!(
            "config field '{field}' must include http:// or https://"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}
