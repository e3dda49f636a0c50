//! Ownership repository implementation
//!
//! Each persisted value lives under its own key so writing the ownership map
//! never touches the checkpoint and vice versa.

use crate::error::{Error, Result};
use crate::models::{DeviceId, OwnershipMap};
use libsql::Connection;

const OWNERSHIP_KEY: &str = "ownership";
const CHECKPOINT_KEY: &str = "checkpoint";
const LAST_ACTIVITY_KEY: &str = "last_activity_time";
const DEVICE_ID_KEY: &str = "device_id";

/// Ownership map as last written, with its save time
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOwnership {
    pub instances: OwnershipMap,
    /// Unix ms
    pub saved_at: i64,
}

/// Trait for durable ownership storage operations (async)
#[allow(async_fn_in_trait)]
pub trait OwnershipRepository {
    /// Load the cached ownership map, if any
    async fn load_ownership(&self) -> Result<Option<StoredOwnership>>;

    /// Replace the cached ownership map
    async fn save_ownership(&self, instances: &OwnershipMap, saved_at: i64) -> Result<()>;

    /// Load the sync checkpoint (Unix ms)
    async fn load_checkpoint(&self) -> Result<Option<i64>>;

    /// Store the sync checkpoint (Unix ms)
    async fn save_checkpoint(&self, checkpoint: i64) -> Result<()>;

    /// Load the last foreground activity time (Unix ms)
    async fn load_last_activity(&self) -> Result<Option<i64>>;

    /// Store the last foreground activity time (Unix ms)
    async fn save_last_activity(&self, at: i64) -> Result<()>;

    /// Load the per-install device id
    async fn load_device_id(&self) -> Result<Option<DeviceId>>;

    /// Store the per-install device id
    async fn save_device_id(&self, device_id: &DeviceId) -> Result<()>;

    /// Forget everything tied to the signed-in user.
    ///
    /// The device id is per install and survives.
    async fn clear_user_state(&self) -> Result<()>;
}

/// libSQL implementation of `OwnershipRepository`
pub struct LibSqlOwnershipRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOwnershipRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl OwnershipRepository for LibSqlOwnershipRepository<'_> {
    async fn load_ownership(&self) -> Result<Option<StoredOwnership>> {
        let Some((value, saved_at)) = self.get_entry(OWNERSHIP_KEY).await? else {
            return Ok(None);
        };
        let instances: OwnershipMap = serde_json::from_str(&value)?;
        Ok(Some(StoredOwnership {
            instances,
            saved_at,
        }))
    }

    async fn save_ownership(&self, instances: &OwnershipMap, saved_at: i64) -> Result<()> {
        let value = serde_json::to_string(instances)?;
        self.set_entry(OWNERSHIP_KEY, &value, saved_at).await
    }

    async fn load_checkpoint(&self) -> Result<Option<i64>> {
        self.get_timestamp(CHECKPOINT_KEY).await
    }

    async fn save_checkpoint(&self, checkpoint: i64) -> Result<()> {
        self.set_entry(CHECKPOINT_KEY, &checkpoint.to_string(), checkpoint)
            .await
    }

    async fn load_last_activity(&self) -> Result<Option<i64>> {
        self.get_timestamp(LAST_ACTIVITY_KEY).await
    }

    async fn save_last_activity(&self, at: i64) -> Result<()> {
        self.set_entry(LAST_ACTIVITY_KEY, &at.to_string(), at).await
    }

    async fn load_device_id(&self) -> Result<Option<DeviceId>> {
        Ok(self
            .get_entry(DEVICE_ID_KEY)
            .await?
            .map(|(value, _)| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(DeviceId::new))
    }

    async fn save_device_id(&self, device_id: &DeviceId) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.set_entry(DEVICE_ID_KEY, device_id.as_str(), now).await
    }

    async fn clear_user_state(&self) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM kv_store WHERE key IN (?, ?, ?)",
                [OWNERSHIP_KEY, CHECKPOINT_KEY, LAST_ACTIVITY_KEY],
            )
            .await?;
        Ok(())
    }
}

impl LibSqlOwnershipRepository<'_> {
    async fn get_entry(&self, key: &str) -> Result<Option<(String, i64)>> {
        let mut rows = self
            .conn
            .query("SELECT value, saved_at FROM kv_store WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            let saved_at: i64 = row.get(1)?;
            Ok(Some((value, saved_at)))
        } else {
            Ok(None)
        }
    }

    async fn get_timestamp(&self, key: &str) -> Result<Option<i64>> {
        let Some((value, _)) = self.get_entry(key).await? else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Database(format!("stored {key} is not a timestamp: {value}")))
    }

    async fn set_entry(&self, key: &str, value: &str, saved_at: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO kv_store (key, value, saved_at) VALUES (?, ?, ?)",
                libsql::params![key, value, saved_at],
            )
            .await?;
        Ok(())
    }
}
