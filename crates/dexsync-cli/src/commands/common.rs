use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dexsync_core::bridge::ReplicationBridge;
use dexsync_core::config::parse_sync_config;
use dexsync_core::models::{InstanceRecord, OwnershipMap};
use dexsync_core::services::RecordPatch;
use dexsync_core::session::{SessionTracker, DEFAULT_INACTIVITY_THRESHOLD};
use dexsync_core::sync::{ActivationReport, CatchUpOutcome, ChannelState};
use dexsync_core::{DeviceId, DurableStore, Identity, OwnershipStore, SyncConfig};
use serde::Serialize;
use serde_json::Value;

use crate::cli::Cli;
use crate::error::CliError;

pub const ENV_DB_PATH: &str = "DEXSYNC_DB_PATH";
pub const ENV_USER_ID: &str = "DEXSYNC_USER_ID";
pub const ENV_USERNAME: &str = "DEXSYNC_USERNAME";
pub const ENV_ACCESS_TOKEN: &str = "DEXSYNC_ACCESS_TOKEN";

/// Options shared by every command
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub db_path: PathBuf,
    pub config_path: Option<PathBuf>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub access_token: Option<String>,
}

impl Context {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            db_path: resolve_db_path(cli.db_path.clone()),
            config_path: cli.config.clone(),
            user_id: cli.user_id.clone().or_else(|| env_text(ENV_USER_ID)),
            username: cli.username.clone().or_else(|| env_text(ENV_USERNAME)),
            access_token: env_text(ENV_ACCESS_TOKEN),
        }
    }

    /// Identity of the signed-in account on this install.
    pub fn identity(&self, device_id: DeviceId) -> Result<Identity, CliError> {
        let user_id = self
            .user_id
            .clone()
            .ok_or(CliError::MissingIdentity(ENV_USER_ID, "user-id"))?;
        let username = self
            .username
            .clone()
            .ok_or(CliError::MissingIdentity(ENV_USERNAME, "username"))?;

        let identity = Identity::new(user_id, username, device_id);
        Ok(match &self.access_token {
            Some(token) => identity.with_access_token(token.clone()),
            None => identity,
        })
    }

    pub fn sync_config(&self) -> Result<SyncConfig, CliError> {
        match &self.config_path {
            Some(path) => Ok(parse_sync_config(&std::fs::read_to_string(path)?)?),
            None => Ok(SyncConfig::from_env()?),
        }
    }
}

fn env_text(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dexsync")
        .join("dexsync.db")
}

pub async fn open_durable(path: &Path) -> Result<DurableStore, CliError> {
    Ok(DurableStore::open_path(path).await?)
}

pub fn build_store(
    durable: DurableStore,
    config: Option<&SyncConfig>,
    bridge: Arc<dyn ReplicationBridge>,
) -> OwnershipStore {
    let threshold = config.map_or(DEFAULT_INACTIVITY_THRESHOLD, SyncConfig::inactivity_threshold);
    let session = SessionTracker::new(durable.clone(), threshold);
    OwnershipStore::new(durable, session, bridge)
}

/// Parse `FIELD=VALUE`, reading VALUE as JSON when possible.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), CliError> {
    let Some((field, value)) = raw.split_once('=') else {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    };
    let field = field.trim();
    if field.is_empty() {
        return Err(CliError::InvalidAssignment(raw.to_string()));
    }

    let value = value.trim();
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), value))
}

pub fn build_patch(assignments: &[String]) -> Result<RecordPatch, CliError> {
    let mut patch = RecordPatch::new();
    for raw in assignments {
        let (field, value) = parse_assignment(raw)?;
        patch.insert(field, value);
    }
    if patch.is_empty() {
        return Err(CliError::EmptyPatch);
    }
    Ok(patch)
}

pub fn format_timestamp(timestamp_ms: Option<i64>) -> String {
    timestamp_ms.map_or_else(
        || "never".to_string(),
        |timestamp_ms| {
            chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
                || timestamp_ms.to_string(),
                |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            )
        },
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct FlagCounts {
    pub records: usize,
    pub owned: usize,
    pub for_trade: usize,
    pub wanted: usize,
    pub unowned: usize,
}

pub fn count_flags(map: &OwnershipMap) -> FlagCounts {
    map.values().fold(
        FlagCounts {
            records: map.len(),
            ..FlagCounts::default()
        },
        |mut counts, record| {
            counts.owned += usize::from(record.flags.is_owned);
            counts.for_trade += usize::from(record.flags.is_for_trade);
            counts.wanted += usize::from(record.flags.is_wanted);
            counts.unowned += usize::from(record.flags.is_unowned);
            counts
        },
    )
}

pub fn format_record_line(key: &str, record: &InstanceRecord) -> String {
    let mut flags = Vec::new();
    if record.flags.is_owned {
        flags.push("owned");
    }
    if record.flags.is_for_trade {
        flags.push("trade");
    }
    if record.flags.is_wanted {
        flags.push("wanted");
    }
    if record.flags.is_unowned {
        flags.push("unowned");
    }
    let flags = if flags.is_empty() {
        "-".to_string()
    } else {
        flags.join(",")
    };
    let updated = format_relative_time(record.last_update, Utc::now().timestamp_millis());
    format!("{key:<48}  {flags:<24}  {updated}")
}

pub const fn describe_channel_state(state: ChannelState) -> &'static str {
    match state {
        ChannelState::Closed => "closed",
        ChannelState::Connecting => "connecting",
        ChannelState::Open => "open",
    }
}

pub fn format_activation_lines(report: &ActivationReport) -> Vec<String> {
    let session = if report.session_new {
        "new session"
    } else {
        "continuing session"
    };
    let catch_up = match &report.catch_up {
        CatchUpOutcome::Skipped => "catch-up skipped".to_string(),
        CatchUpOutcome::Empty => "catch-up: no missed updates".to_string(),
        CatchUpOutcome::Applied { records } => format!("catch-up: merged {records} records"),
        CatchUpOutcome::Failed(reason) => format!("catch-up failed: {reason}"),
    };
    vec![
        session.to_string(),
        catch_up,
        format!("live channel {}", describe_channel_state(report.channel)),
    ]
}
