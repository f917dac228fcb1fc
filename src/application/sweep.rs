//! Removal of artifacts that no longer belong to any entity.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::application::bulk::expected_artifacts;
use crate::domain::artifact::{ArtifactCategory, ArtifactKey};
use crate::domain::snapshot::{Locale, Snapshot};
use crate::infra::artifacts::ArtifactStore;

const TARGET: &str = "ogsync::application::sweep";

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<String>,
}

pub struct OrphanSweeper {
    store: Arc<ArtifactStore>,
    locales: Vec<Locale>,
}

impl OrphanSweeper {
    pub fn new(store: Arc<ArtifactStore>, locales: Vec<Locale>) -> Self {
        Self { store, locales }
    }

    /// Deletes every file in the per-locale category directories that has
    /// no artifact key in `current`.
    ///
    /// Failures are collected per path; one bad file never stops the pass.
    pub async fn sweep(&self, current: &Snapshot) -> SweepReport {
        let mut report = SweepReport::default();

        let on_disk = match self.store.list_locales().await {
            Ok(locales) => locales,
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "sweep::list_locales",
                    result = "error",
                    error = %err,
                    "Failed to list artifact locales"
                );
                report.failures.push(err.to_string());
                return report;
            }
        };

        let mut locales = self.locales.clone();
        locales.extend(on_disk.iter().cloned());
        let expected = expected_artifacts(current, &locales);
        let valid = valid_file_names(&expected);

        for locale in &on_disk {
            for category in ArtifactCategory::DIRECTORIES {
                self.sweep_directory(locale, category, &valid, &mut report)
                    .await;
            }
        }

        info!(
            target = TARGET,
            op = "sweep::run",
            result = if report.failures.is_empty() { "ok" } else { "partial" },
            deleted = report.deleted.len(),
            failed = report.failures.len(),
            "Orphan sweep finished"
        );
        report
    }

    async fn sweep_directory(
        &self,
        locale: &str,
        category: ArtifactCategory,
        valid: &BTreeMap<(&str, ArtifactCategory), BTreeSet<String>>,
        report: &mut SweepReport,
    ) {
        let files = match self.store.list_files(locale, category).await {
            Ok(files) => files,
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "sweep::list_files",
                    result = "error",
                    locale,
                    category = category.as_str(),
                    error = %err,
                    "Failed to list artifact directory"
                );
                report.failures.push(err.to_string());
                return;
            }
        };

        let keep = valid.get(&(locale, category));
        for file_name in files {
            if keep.is_some_and(|names| names.contains(&file_name)) {
                continue;
            }
            let path = self
                .store
                .root()
                .join(locale)
                .join(category.as_str())
                .join(&file_name);
            match self.store.remove_file(locale, category, &file_name).await {
                Ok(true) => {
                    counter!("ogsync_sweep_deleted_total").increment(1);
                    debug!(
                        target = TARGET,
                        op = "sweep::delete",
                        result = "ok",
                        path = %path.display(),
                        "Orphaned artifact deleted"
                    );
                    report.deleted.push(path);
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        target = TARGET,
                        op = "sweep::delete",
                        result = "error",
                        path = %path.display(),
                        error = %err,
                        "Failed to delete orphaned artifact"
                    );
                    report.failures.push(err.to_string());
                }
            }
        }
    }
}

fn valid_file_names(keys: &BTreeSet<ArtifactKey>) -> BTreeMap<(&str, ArtifactCategory), BTreeSet<String>> {
    let mut valid: BTreeMap<(&str, ArtifactCategory), BTreeSet<String>> = BTreeMap::new();
    for key in keys {
        if key.kind().directory().is_none() {
            continue;
        }
        if let Some(locale) = key.locale() {
            valid
                .entry((locale, key.kind()))
                .or_default()
                .insert(key.file_name());
        }
    }
    valid
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use time::macros::datetime;

    use super::*;
    use crate::domain::snapshot::{PageKind, PageRecord};

    fn seed(store: &ArtifactStore, relative: &str) {
        let path = store.root().join(relative);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dirs");
        std::fs::write(path, b"jpeg").expect("write");
    }

    fn remaining(store: &ArtifactStore) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        for locale in std::fs::read_dir(store.root()).expect("root") {
            let locale = locale.expect("entry");
            if !locale.path().is_dir() {
                continue;
            }
            for category in ArtifactCategory::DIRECTORIES {
                let dir = locale.path().join(category.as_str());
                let Ok(entries) = std::fs::read_dir(&dir) else {
                    continue;
                };
                for entry in entries {
                    let entry = entry.expect("entry");
                    files.insert(format!(
                        "{}/{}/{}",
                        locale.file_name().to_string_lossy(),
                        category.as_str(),
                        entry.file_name().to_string_lossy()
                    ));
                }
            }
        }
        files
    }

    #[tokio::test]
    async fn keeps_exactly_the_valid_artifacts() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(ArtifactStore::new(dir.path()));
        for file in [
            "en/post/a.jpg",
            "en/post/gone.jpg",
            "en/category/notes.jpg",
            "en/tag/c%2B%2B.jpg",
            "en/tag/old.jpg",
            "fr/post/a.jpg",
            "en/post/readme.txt",
        ] {
            seed(&store, file);
        }
        seed(&store, "root.jpg");

        let snapshot = Snapshot::new(datetime!(2024-01-01 0:00 UTC))
            .with_page("p1", PageRecord::new(PageKind::Post, "en", "a"))
            .with_page("c1", PageRecord::new(PageKind::Category, "en", "notes"))
            .with_tag("en", "c++", 1);

        let sweeper = OrphanSweeper::new(Arc::clone(&store), vec!["en".to_string()]);
        let report = sweeper.sweep(&snapshot).await;

        assert_eq!(report.deleted.len(), 3);
        assert!(report.failures.is_empty());
        let expected: BTreeSet<String> = [
            "en/category/notes.jpg",
            "en/post/a.jpg",
            "en/post/readme.txt",
            "en/tag/c%2B%2B.jpg",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        assert_eq!(remaining(&store), expected);
        assert!(store.root().join("root.jpg").exists());
    }

    #[tokio::test]
    async fn consistent_tree_is_left_untouched() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(ArtifactStore::new(dir.path()));
        seed(&store, "en/post/a.jpg");
        let snapshot = Snapshot::new(datetime!(2024-01-01 0:00 UTC))
            .with_page("p1", PageRecord::new(PageKind::Post, "en", "a"));

        let sweeper = OrphanSweeper::new(Arc::clone(&store), Vec::new());
        let first = sweeper.sweep(&snapshot).await;
        let second = sweeper.sweep(&snapshot).await;

        assert!(first.deleted.is_empty());
        assert!(second.deleted.is_empty());
        assert!(store.root().join("en/post/a.jpg").exists());
    }

    #[tokio::test]
    async fn missing_root_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let sweeper = OrphanSweeper::new(store, vec!["en".to_string()]);

        let report = sweeper
            .sweep(&Snapshot::new(datetime!(2024-01-01 0:00 UTC)))
            .await;

        assert!(report.deleted.is_empty());
        assert!(report.failures.is_empty());
    }
}
