//! End-to-end runs of the sync pipeline against a real artifact tree and
//! state file, with a renderer that echoes the card it was asked for.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;
use time::macros::datetime;

use ogsync::application::batch::BatchScheduler;
use ogsync::application::bulk::BulkGenerator;
use ogsync::application::diff::DiffOptions;
use ogsync::application::render::{CardRenderer, RenderError, RenderTask};
use ogsync::application::state::SnapshotStore;
use ogsync::application::sync::{
    SnapshotRefreshed, SyncOptions, SyncOrchestrator, SyncOutcome, SyncReport,
};
use ogsync::domain::snapshot::{PageKind, PageRecord, Snapshot};
use ogsync::infra::artifacts::ArtifactStore;
use ogsync::infra::state_store::JsonFileSnapshotStore;

#[derive(Default)]
struct EchoRenderer {
    renders: AtomicUsize,
}

#[async_trait]
impl CardRenderer for EchoRenderer {
    async fn render(&self, task: &RenderTask) -> Result<Vec<u8>, RenderError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let title = task
            .snapshot
            .pages
            .values()
            .find(|page| task.target_url.ends_with(&format!("/{}", page.slug)))
            .map(|page| page.title.clone())
            .unwrap_or_default();
        Ok(format!("{}|{title}", task.target_url).into_bytes())
    }
}

struct Site {
    dir: TempDir,
    renderer: Arc<EchoRenderer>,
    artifacts: Arc<ArtifactStore>,
    store: Arc<dyn SnapshotStore>,
}

impl Site {
    fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::new(
            dir.path().join(".ogsync/state.json"),
        ));
        Self {
            artifacts: Arc::new(ArtifactStore::new(dir.path())),
            renderer: Arc::new(EchoRenderer::default()),
            store,
            dir,
        }
    }

    fn renderer(&self) -> Arc<dyn CardRenderer> {
        self.renderer.clone()
    }

    fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.renderer(),
            Arc::clone(&self.artifacts),
            Arc::clone(&self.store),
            vec!["en".to_string()],
            SyncOptions {
                concurrency: NonZeroUsize::new(3).expect("non-zero"),
                diff: DiffOptions::default(),
            },
        )
    }

    fn artifact(&self, relative: &str) -> Option<String> {
        let path = self.dir.path().join("social-images").join(relative);
        std::fs::read_to_string(path).ok()
    }

    fn exists(&self, relative: &str) -> bool {
        Path::new(&self.dir.path().join("social-images").join(relative)).exists()
    }
}

fn s1() -> Snapshot {
    Snapshot::new(datetime!(2024-03-01 0:00 UTC))
        .with_page("p1", PageRecord::new(PageKind::Post, "en", "a").with_title("A"))
        .with_page(
            "c1",
            PageRecord::new(PageKind::Category, "en", "notes").with_title("Notes"),
        )
}

fn s2() -> Snapshot {
    s1().with_page("p2", PageRecord::new(PageKind::Post, "en", "b").with_title("B"))
        .with_tag("en", "rust", 2)
}

fn s3() -> Snapshot {
    let mut snapshot = s2();
    snapshot.pages.remove("p1");
    if let Some(page) = snapshot.pages.get_mut("p2") {
        page.title = "B, revised".to_string();
    }
    snapshot.captured_at = datetime!(2024-03-03 0:00 UTC);
    snapshot
}

fn completed(outcome: SyncOutcome) -> SyncReport {
    match outcome {
        SyncOutcome::Completed(report) => report,
        other => panic!("expected completed sync, got {other:?}"),
    }
}

#[tokio::test]
async fn generate_all_then_incremental_syncs_track_content() {
    let site = Site::new();

    let bulk = BulkGenerator::new(
        BatchScheduler::new(site.renderer()),
        Arc::clone(&site.artifacts),
        Arc::clone(&site.store),
        vec!["en".to_string()],
        NonZeroUsize::new(2).expect("non-zero"),
    )
    .run(Arc::new(s1()))
    .await
    .expect("bulk generation");

    assert_eq!(bulk.failed, 0);
    assert!(bulk.persisted);
    assert_eq!(site.artifact("en/post/a.jpg").as_deref(), Some("/en/post/a|A"));
    assert!(site.exists("root.jpg"));
    assert!(site.exists("en/all-tags.jpg"));
    assert!(site.exists("en/category/notes.jpg"));

    let orchestrator = site.orchestrator();

    let report = completed(orchestrator.sync(SnapshotRefreshed::new(s2())).await);
    assert!(!report.cold_start);
    assert_eq!(report.failed, 0);
    assert!(report.persisted);
    assert_eq!(site.artifact("en/post/b.jpg").as_deref(), Some("/en/post/b|B"));
    assert!(site.exists("en/tag/rust.jpg"));
    assert_eq!(site.artifact("en/post/a.jpg").as_deref(), Some("/en/post/a|A"));

    let report = completed(orchestrator.sync(SnapshotRefreshed::new(s3())).await);
    assert!(report.persisted);
    assert!(!site.exists("en/post/a.jpg"));
    assert_eq!(
        site.artifact("en/post/b.jpg").as_deref(),
        Some("/en/post/b|B, revised")
    );
    assert!(site.exists("en/tag/rust.jpg"));

    let saved = site.store.load().await.expect("load").expect("saved snapshot");
    assert_eq!(saved, s3());
}

#[tokio::test]
async fn unchanged_snapshot_renders_nothing() {
    let site = Site::new();
    let orchestrator = site.orchestrator();

    completed(orchestrator.sync(SnapshotRefreshed::new(s1())).await);
    let before = site.renderer.renders.load(Ordering::SeqCst);

    let report = completed(orchestrator.sync(SnapshotRefreshed::new(s1())).await);

    assert_eq!(report.planned, 0);
    assert_eq!(report.generated, 0);
    assert_eq!(site.renderer.renders.load(Ordering::SeqCst), before);
}

#[tokio::test]
async fn sweep_removes_files_nothing_maps_to() {
    let site = Site::new();
    let stray = site.dir.path().join("social-images/en/post");
    std::fs::create_dir_all(&stray).expect("dirs");
    std::fs::write(stray.join("ghost.jpg"), b"old").expect("write");

    let orchestrator = site.orchestrator();
    let report = completed(orchestrator.sync(SnapshotRefreshed::new(s1())).await);

    assert!(report.cold_start);
    assert_eq!(report.swept, 1);
    assert!(!site.exists("en/post/ghost.jpg"));
}
