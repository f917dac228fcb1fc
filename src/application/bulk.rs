//! Cold-start generation of the complete artifact tree.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::application::batch::{BatchScheduler, BatchTask};
use crate::application::error::SyncError;
use crate::application::render::RenderTask;
use crate::application::state::SnapshotStore;
use crate::domain::artifact::ArtifactKey;
use crate::domain::snapshot::{Locale, Snapshot};
use crate::infra::artifacts::ArtifactStore;

const TARGET: &str = "ogsync::application::bulk";

/// Every artifact that should exist for `snapshot`.
///
/// `locales` adds locales that have no content yet, so their all-tags card
/// still exists.
pub fn expected_artifacts(snapshot: &Snapshot, locales: &[Locale]) -> BTreeSet<ArtifactKey> {
    let mut keys = BTreeSet::from([ArtifactKey::Root]);

    let mut all_locales: BTreeSet<&str> = locales.iter().map(String::as_str).collect();
    all_locales.extend(snapshot.locales());
    for locale in all_locales {
        keys.insert(ArtifactKey::all_tags(locale));
        keys.extend(snapshot.tags(locale).map(|tag| ArtifactKey::tag(locale, tag)));
    }

    keys.extend(snapshot.pages.values().filter_map(ArtifactKey::for_page));
    keys
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub planned: usize,
    pub rendered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub persisted: bool,
    pub elapsed_ms: u64,
    pub failures: Vec<String>,
}

pub struct BulkGenerator {
    scheduler: BatchScheduler,
    artifacts: Arc<ArtifactStore>,
    store: Arc<dyn SnapshotStore>,
    locales: Vec<Locale>,
    concurrency: NonZeroUsize,
}

impl BulkGenerator {
    pub fn new(
        scheduler: BatchScheduler,
        artifacts: Arc<ArtifactStore>,
        store: Arc<dyn SnapshotStore>,
        locales: Vec<Locale>,
        concurrency: NonZeroUsize,
    ) -> Self {
        Self {
            scheduler,
            artifacts,
            store,
            locales,
            concurrency,
        }
    }

    /// Renders every missing artifact, then records `snapshot` as the
    /// baseline for incremental syncs.
    pub async fn run(&self, snapshot: Arc<Snapshot>) -> Result<BulkReport, SyncError> {
        let started_at = Instant::now();
        snapshot.validate()?;

        let mut locales = self.locales.clone();
        for locale in snapshot.locales() {
            if !locales.iter().any(|known| known == locale) {
                locales.push(locale.to_string());
            }
        }
        self.artifacts.ensure_layout(&locales).await?;

        let keys = expected_artifacts(&snapshot, &locales);
        let tasks: Vec<BatchTask> = keys
            .iter()
            .map(|key| {
                BatchTask::new(
                    RenderTask::for_artifact(key, Arc::clone(&snapshot)),
                    self.artifacts.path_for(key),
                )
            })
            .collect();
        info!(
            target = TARGET,
            op = "bulk::plan",
            planned = tasks.len(),
            locales = locales.len(),
            "Bulk generation planned"
        );

        let result = self
            .scheduler
            .run(tasks, self.concurrency, |progress| {
                info!(
                    target = TARGET,
                    op = "bulk::progress",
                    completed = progress.completed,
                    total = progress.total,
                    "Bulk generation progress"
                );
            })
            .await;

        if result.browser_unavailable() {
            return Err(SyncError::BrowserUnavailable {
                failed: result.failure_count,
            });
        }

        let persisted = match self.store.save(&snapshot).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "bulk::persist",
                    result = "error",
                    error = %err,
                    "Failed to persist snapshot after bulk generation"
                );
                false
            }
        };

        let report = BulkReport {
            planned: keys.len(),
            rendered: result.rendered_count(),
            skipped: result.skipped_count,
            failed: result.failure_count,
            persisted,
            elapsed_ms: started_at.elapsed().as_millis() as u64,
            failures: result
                .errors
                .iter()
                .map(|failure| format!("{}: {}", failure.label, failure.error))
                .collect(),
        };
        info!(
            target = TARGET,
            op = "bulk::run",
            result = if report.failed == 0 { "ok" } else { "partial" },
            planned = report.planned,
            rendered = report.rendered,
            skipped = report.skipped,
            failed = report.failed,
            persisted = report.persisted,
            elapsed_ms = report.elapsed_ms,
            "Bulk generation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::domain::snapshot::{PageKind, PageRecord};

    #[test]
    fn expected_artifacts_cover_every_category() {
        let snapshot = Snapshot::new(datetime!(2024-01-01 0:00 UTC))
            .with_page("p1", PageRecord::new(PageKind::Post, "en", "a"))
            .with_page("h1", PageRecord::new(PageKind::Home, "en", "about"))
            .with_page("c1", PageRecord::new(PageKind::Category, "zh", "notes"))
            .with_page("o1", PageRecord::new(PageKind::Other, "en", "misc"))
            .with_tag("en", "x", 2)
            .with_tag("en", "stale", 0);

        let keys = expected_artifacts(&snapshot, &["en".to_string(), "de".to_string()]);

        let expected: BTreeSet<ArtifactKey> = [
            ArtifactKey::Root,
            ArtifactKey::all_tags("de"),
            ArtifactKey::all_tags("en"),
            ArtifactKey::all_tags("zh"),
            ArtifactKey::post("en", "a"),
            ArtifactKey::post("en", "about"),
            ArtifactKey::category("zh", "notes"),
            ArtifactKey::tag("en", "x"),
        ]
        .into_iter()
        .collect();
        assert_eq!(keys, expected);
    }
}
