//! Persistence seam for the last successfully synced snapshot.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::snapshot::Snapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file `{path}` could not be decoded: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file `{path}` has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to write state file `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state store task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The last saved snapshot, or `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Replaces the saved snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError>;
}
