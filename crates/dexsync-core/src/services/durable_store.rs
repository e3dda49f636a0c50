//! Shared durable store wrapper used by the ownership store and session tracker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::db::{Database, LibSqlOwnershipRepository, OwnershipRepository, StoredOwnership};
use crate::models::{DeviceId, OwnershipMap};
use crate::Result;

/// Thread-safe handle over the local libSQL database.
#[derive(Clone)]
pub struct DurableStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl DurableStore {
    /// Open the store at the given filesystem path.
    ///
    /// A file that is not a database is moved aside and replaced by a fresh
    /// one; the cached map is rebuilt from the server on the next activation.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::open(&db_path).await {
            Ok(db) => db,
            Err(error) if Self::is_corrupted_db_error(&error) => {
                tracing::warn!(
                    "Local store at {} is unreadable: {}. Moving it aside and starting fresh.",
                    db_path.display(),
                    error
                );
                Self::quarantine_corrupted_db_files(&db_path)?;
                Database::open(&db_path).await?
            }
            Err(error) => return Err(error),
        };

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn is_corrupted_db_error(error: &crate::Error) -> bool {
        error
            .to_string()
            .to_ascii_lowercase()
            .contains("file is not a database")
    }

    fn quarantine_corrupted_db_files(db_path: &Path) -> Result<()> {
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let base_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("dexsync.db");
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local store from {} to {}",
                db_path.display(),
                backup_path.display()
            );
        }

        let Some(parent) = db_path.parent() else {
            return Ok(());
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(());
        };
        // WAL and shared-memory sidecars
        let sidecar_prefix = format!("{base_name}-");

        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale store sidecar {}", path.display());
            }
        }

        Ok(())
    }

    /// Load the cached ownership map.
    pub async fn load_ownership(&self) -> Result<Option<StoredOwnership>> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.load_ownership().await
    }

    /// Replace the cached ownership map.
    pub async fn save_ownership(&self, instances: &OwnershipMap, saved_at: i64) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.save_ownership(instances, saved_at).await
    }

    /// Load the sync checkpoint.
    pub async fn load_checkpoint(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.load_checkpoint().await
    }

    /// Store the sync checkpoint.
    pub async fn save_checkpoint(&self, checkpoint: i64) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.save_checkpoint(checkpoint).await
    }

    /// Load the last foreground activity time.
    pub async fn load_last_activity(&self) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.load_last_activity().await
    }

    /// Store the last foreground activity time.
    pub async fn save_last_activity(&self, at: i64) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.save_last_activity(at).await
    }

    /// Return the stored device id, generating and storing one on first use.
    pub async fn device_id(&self) -> Result<DeviceId> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        if let Some(device_id) = repo.load_device_id().await? {
            return Ok(device_id);
        }

        let device_id = DeviceId::generate();
        repo.save_device_id(&device_id).await?;
        tracing::info!(device_id = %device_id, "Generated new device id");
        Ok(device_id)
    }

    /// Remove the ownership map, checkpoint and activity time.
    pub async fn clear_user_state(&self) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlOwnershipRepository::new(db.connection());
        repo.clear_user_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceKey, InstanceRecord};
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn device_id_is_stable() {
        let store = DurableStore::open_in_memory().await.unwrap();
        let first = store.device_id().await.unwrap();
        let second = store.device_id().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn state_survives_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("nested").join("dexsync.db");

        let instances = OwnershipMap::from([(InstanceKey::from("025_pika_1"), InstanceRecord::new(7))]);
        {
            let store = DurableStore::open_path(&path).await.unwrap();
            store.save_ownership(&instances, 100).await.unwrap();
            store.save_checkpoint(200).await.unwrap();
        }

        let reopened = DurableStore::open_path(&path).await.unwrap();
        let stored = reopened.load_ownership().await.unwrap().unwrap();
        assert_eq!(stored.instances, instances);
        assert_eq!(reopened.load_checkpoint().await.unwrap(), Some(200));
        assert_eq!(reopened.path(), Some(path.as_path()));
    }

    #[test]
    fn detects_corrupted_store_errors() {
        assert!(DurableStore::is_corrupted_db_error(&crate::Error::Database(
            "SQLite failure: file is not a database".to_string()
        )));
        assert!(!DurableStore::is_corrupted_db_error(&crate::Error::InvalidInput(
            "bad key".to_string()
        )));
    }

    #[test]
    fn quarantine_moves_db_and_removes_sidecars() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("dexsync.db");
        let wal_path = tmp.path().join("dexsync.db-wal");
        let shm_path = tmp.path().join("dexsync.db-shm");

        std::fs::write(&db_path, b"bad-db").unwrap();
        std::fs::write(&wal_path, b"wal").unwrap();
        std::fs::write(&shm_path, b"shm").unwrap();

        DurableStore::quarantine_corrupted_db_files(&db_path).unwrap();

        assert!(!db_path.exists());
        assert!(!wal_path.exists());
        assert!(!shm_path.exists());

        let found_backup = std::fs::read_dir(tmp.path()).unwrap().any(|entry| {
            entry
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("dexsync.db.corrupt-")
        });
        assert!(found_backup);
    }
}
