//! On-disk snapshot of the replica.
//!
//! The catalog loads the last snapshot at startup so it can serve reads
//! before the first event arrives, and saves one periodically and at
//! shutdown. A snapshot is only as fresh as its last save; events missed
//! while the service was down are not recovered.
//!
//! # Example
//!
//! ```rust,no_run
//! use catalog_sync::replica::{InMemoryReplica, ReplicaSnapshot, SnapshotStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SnapshotStore::new("catalog.snapshot.json");
//!
//!     let replica = match store.load().await? {
//!         Some(snapshot) => InMemoryReplica::from_entries(snapshot.entries),
//!         None => InMemoryReplica::new(),
//!     };
//!
//!     store.save(&ReplicaSnapshot::capture(&replica, 0)?).await?;
//!     Ok(())
//! }
//! ```

use super::store::{CatalogEntry, ReplicaStore};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Point-in-time copy of every catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub entries: Vec<CatalogEntry>,
    /// When this snapshot was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Events applied by this process when the snapshot was taken
    pub events_applied: u64,
}

impl ReplicaSnapshot {
    pub fn new(entries: Vec<CatalogEntry>, events_applied: u64) -> Self {
        Self {
            entries,
            timestamp: chrono::Utc::now(),
            events_applied,
        }
    }

    pub fn capture<R: ReplicaStore + ?Sized>(replica: &R, events_applied: u64) -> Result<Self> {
        Ok(Self::new(replica.get_all()?, events_applied))
    }
}

/// Persists snapshots with atomic replace, so a crash mid-write leaves the
/// previous snapshot intact.
pub struct SnapshotStore {
    file_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// `None` if no snapshot was ever saved.
    pub async fn load(&self) -> Result<Option<ReplicaSnapshot>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No snapshot file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read snapshot file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<ReplicaSnapshot>(&content) {
            Ok(snapshot) => {
                info!(
                    entries = snapshot.entries.len(),
                    timestamp = %snapshot.timestamp,
                    "Loaded replica snapshot"
                );
                Ok(Some(snapshot))
            }
            Err(e) => {
                error!("Failed to parse snapshot file: {}", e);
                Err(Error::Serialization(e))
            }
        }
    }

    /// Write to a temp file, fsync, then rename over the old snapshot.
    pub async fn save(&self, snapshot: &ReplicaSnapshot) -> Result<()> {
        debug!(entries = snapshot.entries.len(), "Saving replica snapshot");

        let temp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(snapshot)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted replica snapshot");
        }
        Ok(())
    }
}
