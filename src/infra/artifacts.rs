//! Filesystem storage for generated card images.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::domain::artifact::{ARTIFACT_EXTENSION, ARTIFACT_ROOT, ArtifactCategory, ArtifactKey};

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("invalid artifact path")]
    InvalidPath,
    #[error("artifact io failed for `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArtifactStoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Card images below `<public_dir>/social-images`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(public_dir: impl AsRef<Path>) -> Self {
        Self {
            root: public_dir.as_ref().join(ARTIFACT_ROOT),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    fn category_dir(&self, locale: &str, category: ArtifactCategory) -> Option<PathBuf> {
        category
            .directory()
            .map(|directory| self.root.join(locale).join(directory))
    }

    /// Creates every per-locale category directory.
    pub async fn ensure_layout(&self, locales: &[String]) -> Result<(), ArtifactStoreError> {
        for locale in locales {
            for category in ArtifactCategory::DIRECTORIES {
                if let Some(dir) = self.category_dir(locale, category) {
                    fs::create_dir_all(&dir)
                        .await
                        .map_err(|err| ArtifactStoreError::io(&dir, err))?;
                }
            }
        }
        Ok(())
    }

    /// Removes the artifact. Returns `false` when it did not exist.
    pub async fn remove(&self, key: &ArtifactKey) -> Result<bool, ArtifactStoreError> {
        remove_file(&self.path_for(key)).await
    }

    /// Locale directories currently present under the root.
    pub async fn list_locales(&self) -> Result<Vec<String>, ArtifactStoreError> {
        let mut locales = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(locales),
            Err(err) => return Err(ArtifactStoreError::io(&self.root, err)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ArtifactStoreError::io(&self.root, err))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            if is_dir && let Some(name) = entry.file_name().to_str() {
                locales.push(name.to_string());
            }
        }
        locales.sort();
        Ok(locales)
    }

    /// File names of the `.jpg` artifacts in one category directory.
    pub async fn list_files(
        &self,
        locale: &str,
        category: ArtifactCategory,
    ) -> Result<Vec<String>, ArtifactStoreError> {
        let Some(dir) = self.category_dir(locale, category) else {
            return Ok(Vec::new());
        };
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(ArtifactStoreError::io(&dir, err)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| ArtifactStoreError::io(&dir, err))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|kind| kind.is_file())
                .unwrap_or(false);
            let path = entry.path();
            let is_artifact = path
                .extension()
                .is_some_and(|extension| extension == ARTIFACT_EXTENSION);
            if is_file
                && is_artifact
                && let Some(name) = entry.file_name().to_str()
            {
                files.push(name.to_string());
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn remove_file(
        &self,
        locale: &str,
        category: ArtifactCategory,
        file_name: &str,
    ) -> Result<bool, ArtifactStoreError> {
        let dir = self
            .category_dir(locale, category)
            .ok_or(ArtifactStoreError::InvalidPath)?;
        remove_file(&dir.join(file_name)).await
    }
}

pub async fn artifact_exists(path: &Path) -> Result<bool, ArtifactStoreError> {
    fs::try_exists(path)
        .await
        .map_err(|err| ArtifactStoreError::io(path, err))
}

/// Writes `bytes` to `path` through a temporary sibling so readers never
/// observe a partial image.
pub async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), ArtifactStoreError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or(ArtifactStoreError::InvalidPath)?;
    let temporary = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&temporary, bytes)
        .await
        .map_err(|err| ArtifactStoreError::io(&temporary, err))?;
    if let Err(err) = fs::rename(&temporary, path).await {
        let _ = fs::remove_file(&temporary).await;
        return Err(ArtifactStoreError::io(path, err));
    }
    Ok(())
}

async fn remove_file(path: &Path) -> Result<bool, ArtifactStoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ArtifactStoreError::io(path, err)),
    }
}
