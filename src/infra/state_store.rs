//! JSON file backed [`SnapshotStore`].

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::info;

use crate::application::state::{SnapshotStore, StoreError};
use crate::domain::snapshot::Snapshot;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateDocument {
    version: u32,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let document: StateDocument =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Decode {
                path: self.path.clone(),
                source,
            })?;
        if document.version != STATE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: self.path.clone(),
                version: document.version,
            });
        }
        Ok(Some(document.snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let document = StateDocument {
            version: STATE_VERSION,
            saved_at: OffsetDateTime::now_utc(),
            snapshot: snapshot.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&document).map_err(StoreError::Encode)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || persist_atomically(&path, &encoded))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))??;

        info!(
            target = "ogsync::infra::state_store",
            op = "state_store::save",
            result = "ok",
            path = %self.path.display(),
            pages = snapshot.pages.len(),
            "Snapshot persisted"
        );
        Ok(())
    }
}

fn persist_atomically(path: &Path, encoded: &[u8]) -> Result<(), StoreError> {
    let write_error = |source: std::io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(write_error)?;

    let mut file = NamedTempFile::new_in(parent).map_err(write_error)?;
    file.write_all(encoded).map_err(write_error)?;
    file.flush().map_err(write_error)?;
    file.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}
