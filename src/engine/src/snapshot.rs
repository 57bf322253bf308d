//! Point-in-time engine state and where it gets saved.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineResult;
use crate::models::{LedgerAccount, NarratorStats, Pool, StorySession};

/// Logical state of the engine: accounts by player, narrators, sessions, pools with wagers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub taken_at: DateTime<Utc>,
    pub accounts: Vec<LedgerAccount>,
    pub narrators: Vec<NarratorStats>,
    pub sessions: Vec<StorySession>,
    pub pools: Vec<Pool>,
}

/// Trait for saving and loading snapshots.
/// Mockable for testing via mockall.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &EngineSnapshot) -> EngineResult<()>;

    /// Latest saved snapshot, or `None` if nothing was saved yet.
    async fn load(&self) -> EngineResult<Option<EngineSnapshot>>;
}

/// Snapshot kept as pretty JSON in a single file.
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn save(&self, snapshot: &EngineSnapshot) -> EngineResult<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        // Write to a sibling temp file, then rename over the target
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(
            "[SNAPSHOT] Saved {} accounts, {} narrators, {} pools to {}",
            snapshot.accounts.len(),
            snapshot.narrators.len(),
            snapshot.pools.len(),
            self.path.display()
        );
        Ok(())
    }

    async fn load(&self) -> EngineResult<Option<EngineSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
