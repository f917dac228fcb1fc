//! Incremental synchronisation of the artifact tree with a fresh snapshot.
//!
//! One run walks `Comparing → Deleting → Generating → Sweeping →
//! Persisting` and returns to `Idle`. At most one run is active; a
//! snapshot arriving meanwhile is dropped because a newer one will follow.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use metrics::{counter, histogram};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::application::batch::{BatchProgress, BatchScheduler, BatchTask};
use crate::application::diff::{DiffOptions, SyncDelta, diff_with};
use crate::application::error::SyncError;
use crate::application::render::{CardRenderer, RenderTask};
use crate::application::state::SnapshotStore;
use crate::application::sweep::OrphanSweeper;
use crate::domain::snapshot::{Locale, Snapshot};
use crate::infra::artifacts::ArtifactStore;

const TARGET: &str = "ogsync::application::sync";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Comparing,
    Deleting,
    Generating,
    Sweeping,
    Persisting,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub cold_start: bool,
    pub planned: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deleted: usize,
    pub swept: usize,
    pub persisted: bool,
    pub elapsed_ms: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub failures: Vec<String>,
}

/// Polled view of the orchestrator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub progress: Option<BatchProgress>,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
}

/// A new snapshot is available from the content source.
#[derive(Debug, Clone)]
pub struct SnapshotRefreshed {
    pub snapshot: Arc<Snapshot>,
}

impl SnapshotRefreshed {
    pub fn new(snapshot: impl Into<Arc<Snapshot>>) -> Self {
        Self {
            snapshot: snapshot.into(),
        }
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another run was in progress.
    Dropped,
    Failed(SyncError),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub concurrency: NonZeroUsize,
    pub diff: DiffOptions,
}

/// Clears the in-progress flag and the transient status on every exit path.
struct SyncGuard {
    syncing: Arc<AtomicBool>,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.status.send_modify(|status| {
            status.phase = SyncPhase::Idle;
            status.progress = None;
        });
        self.syncing.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn SnapshotStore>,
    artifacts: Arc<ArtifactStore>,
    renderer: Arc<dyn CardRenderer>,
    scheduler: BatchScheduler,
    sweeper: OrphanSweeper,
    options: SyncOptions,
    syncing: Arc<AtomicBool>,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl SyncOrchestrator {
    pub fn new(
        renderer: Arc<dyn CardRenderer>,
        artifacts: Arc<ArtifactStore>,
        store: Arc<dyn SnapshotStore>,
        locales: Vec<Locale>,
        options: SyncOptions,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            store,
            scheduler: BatchScheduler::new(Arc::clone(&renderer)),
            sweeper: OrphanSweeper::new(Arc::clone(&artifacts), locales),
            artifacts,
            renderer,
            options,
            syncing: Arc::new(AtomicBool::new(false)),
            status: Arc::new(status),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    fn try_begin(&self) -> Option<SyncGuard> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                syncing: Arc::clone(&self.syncing),
                status: Arc::clone(&self.status),
            })
    }

    /// Starts a run in the background. Returns `false` when the event was
    /// dropped because a run is already active.
    pub fn trigger(self: &Arc<Self>, event: SnapshotRefreshed) -> bool {
        let Some(guard) = self.try_begin() else {
            self.record_dropped();
            return false;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_guarded(guard, event).await;
        });
        true
    }

    /// Runs one sync to completion on the current task.
    pub async fn sync(&self, event: SnapshotRefreshed) -> SyncOutcome {
        match self.try_begin() {
            Some(guard) => self.run_guarded(guard, event).await,
            None => {
                self.record_dropped();
                SyncOutcome::Dropped
            }
        }
    }

    fn record_dropped(&self) {
        counter!("ogsync_sync_total", "outcome" => "dropped").increment(1);
        info!(
            target = TARGET,
            op = "sync::trigger",
            result = "dropped",
            "Sync already in progress; snapshot dropped"
        );
    }

    async fn run_guarded(&self, guard: SyncGuard, event: SnapshotRefreshed) -> SyncOutcome {
        let started_at = Instant::now();
        let outcome = self.run(event.snapshot, started_at).await;
        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!("ogsync_sync_ms").record(elapsed_ms as f64);

        let outcome = match outcome {
            Ok(report) => {
                counter!("ogsync_sync_total", "outcome" => "completed").increment(1);
                info!(
                    target = TARGET,
                    op = "sync::run",
                    result = if report.failed == 0 { "ok" } else { "partial" },
                    cold_start = report.cold_start,
                    generated = report.generated,
                    skipped = report.skipped,
                    failed = report.failed,
                    deleted = report.deleted,
                    swept = report.swept,
                    persisted = report.persisted,
                    elapsed_ms,
                    "Sync finished"
                );
                self.status.send_modify(|status| {
                    status.last_report = Some(report.clone());
                    status.last_error = None;
                });
                SyncOutcome::Completed(report)
            }
            Err(err) => {
                counter!("ogsync_sync_total", "outcome" => "failed").increment(1);
                error!(
                    target = TARGET,
                    op = "sync::run",
                    result = "error",
                    browser_unavailable = err.is_browser_unavailable(),
                    elapsed_ms,
                    error = %err,
                    "Sync aborted; previous snapshot kept"
                );
                let message = err.to_string();
                self.status.send_modify(|status| status.last_error = Some(message));
                SyncOutcome::Failed(err)
            }
        };
        drop(guard);
        outcome
    }

    fn enter(&self, phase: SyncPhase) {
        self.status.send_modify(|status| status.phase = phase);
    }

    async fn run(
        &self,
        current: Arc<Snapshot>,
        started_at: Instant,
    ) -> Result<SyncReport, SyncError> {
        self.enter(SyncPhase::Comparing);
        current.validate()?;
        let previous = match self.store.load().await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "sync::load_state",
                    result = "error",
                    error = %err,
                    "Stored snapshot unreadable; treating as first run"
                );
                None
            }
        };
        let cold_start = previous.is_none();
        let delta = diff_with(previous.as_ref(), &current, self.options.diff);
        info!(
            target = TARGET,
            op = "sync::diff",
            cold_start,
            delta = %delta,
            "Snapshots compared"
        );

        if !delta.to_generate.is_empty() {
            self.renderer.warm_up().await?;
        }

        self.enter(SyncPhase::Deleting);
        let deleted = self.delete_stale(&delta).await;

        self.enter(SyncPhase::Generating);
        let tasks: Vec<BatchTask> = delta
            .to_generate
            .iter()
            .map(|key| {
                BatchTask::new(
                    RenderTask::for_artifact(key, Arc::clone(&current)),
                    self.artifacts.path_for(key),
                )
            })
            .collect();
        let planned = tasks.len();
        let result = self
            .scheduler
            .run(tasks, self.options.concurrency, |progress| {
                self.status
                    .send_modify(|status| status.progress = Some(progress));
            })
            .await;
        if result.browser_unavailable() {
            return Err(SyncError::BrowserUnavailable {
                failed: result.failure_count,
            });
        }

        self.enter(SyncPhase::Sweeping);
        let sweep = self.sweeper.sweep(&current).await;

        self.enter(SyncPhase::Persisting);
        let persisted = match self.store.save(&current).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "sync::persist",
                    result = "error",
                    error = %err,
                    "Failed to persist snapshot; next sync re-diffs from the stored state"
                );
                false
            }
        };

        let mut failures: Vec<String> = result
            .errors
            .iter()
            .map(|failure| format!("{}: {}", failure.label, failure.error))
            .collect();
        failures.extend(sweep.failures);
        Ok(SyncReport {
            cold_start,
            planned,
            generated: result.rendered_count(),
            skipped: result.skipped_count,
            failed: result.failure_count,
            deleted,
            swept: sweep.deleted.len(),
            persisted,
            elapsed_ms: started_at.elapsed().as_millis() as u64,
            finished_at: Some(OffsetDateTime::now_utc()),
            failures,
        })
    }

    async fn delete_stale(&self, delta: &SyncDelta) -> usize {
        let mut deleted = 0;
        for key in delta.stale_artifacts() {
            match self.artifacts.remove(&key).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    target = TARGET,
                    op = "sync::delete",
                    result = "error",
                    artifact = %key,
                    error = %err,
                    "Failed to delete stale artifact"
                ),
            }
        }
        deleted
    }
}
