//! Bounded-concurrency execution of render tasks.
//!
//! Tasks run in fixed-size chunks: every task of a chunk is spawned, the
//! chunk is awaited as a whole, progress is reported, and the next chunk
//! starts. A failing or panicking task never affects its siblings.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::application::render::{CardRenderer, RenderError, RenderTask};
use crate::domain::artifact::ArtifactKey;
use crate::infra::artifacts::{ArtifactStoreError, artifact_exists, write_artifact};

const TARGET: &str = "ogsync::application::batch";

/// A render task together with the file it produces.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub task: RenderTask,
    pub output: PathBuf,
}

impl BatchTask {
    pub fn new(task: RenderTask, output: PathBuf) -> Self {
        Self { task, output }
    }

    fn label(&self) -> String {
        match &self.task.key {
            Some(key) => key.to_string(),
            None => self.task.target_url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Error)]
pub enum BatchTaskError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Storage(#[from] ArtifactStoreError),
    #[error("render task aborted: {0}")]
    Aborted(String),
}

impl BatchTaskError {
    pub fn is_browser_unavailable(&self) -> bool {
        matches!(self, BatchTaskError::Render(err) if err.is_browser_unavailable())
    }
}

#[derive(Debug)]
pub struct BatchFailure {
    pub label: String,
    pub key: Option<ArtifactKey>,
    pub error: BatchTaskError,
}

/// Skipped tasks count as successes.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn rendered_count(&self) -> usize {
        self.success_count - self.skipped_count
    }

    pub fn browser_unavailable(&self) -> bool {
        self.errors
            .iter()
            .any(|failure| failure.error.is_browser_unavailable())
    }
}

enum TaskOutcome {
    Rendered,
    Skipped,
}

#[derive(Clone)]
pub struct BatchScheduler {
    renderer: Arc<dyn CardRenderer>,
}

impl BatchScheduler {
    pub fn new(renderer: Arc<dyn CardRenderer>) -> Self {
        Self { renderer }
    }

    pub async fn run<F>(
        &self,
        tasks: Vec<BatchTask>,
        concurrency: NonZeroUsize,
        mut on_progress: F,
    ) -> BatchResult
    where
        F: FnMut(BatchProgress) + Send,
    {
        let started_at = Instant::now();
        let total = tasks.len();
        let mut result = BatchResult::default();
        if total == 0 {
            return result;
        }

        let directories: BTreeSet<PathBuf> = tasks
            .iter()
            .filter_map(|task| task.output.parent().map(PathBuf::from))
            .collect();
        for directory in &directories {
            if let Err(err) = tokio::fs::create_dir_all(directory).await {
                warn!(
                    target = TARGET,
                    op = "batch::prepare",
                    result = "error",
                    directory = %directory.display(),
                    error = %err,
                    "Failed to create artifact directory"
                );
            }
        }

        let mut completed = 0;
        let mut remaining = tasks.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<BatchTask> = remaining.by_ref().take(concurrency.get()).collect();
            let identities: Vec<(String, Option<ArtifactKey>)> = chunk
                .iter()
                .map(|task| (task.label(), task.task.key.clone()))
                .collect();

            let handles = chunk.into_iter().map(|task| {
                let renderer = Arc::clone(&self.renderer);
                tokio::spawn(async move { execute(renderer.as_ref(), task).await })
            });
            let outcomes = join_all(handles).await;

            for ((label, key), outcome) in identities.into_iter().zip(outcomes) {
                let outcome = outcome
                    .map_err(|err| BatchTaskError::Aborted(err.to_string()))
                    .and_then(|inner| inner);
                match outcome {
                    Ok(TaskOutcome::Rendered) => result.success_count += 1,
                    Ok(TaskOutcome::Skipped) => {
                        result.success_count += 1;
                        result.skipped_count += 1;
                        counter!("ogsync_batch_skipped_total").increment(1);
                    }
                    Err(error) => {
                        warn!(
                            target = TARGET,
                            op = "batch::task",
                            result = "error",
                            artifact = %label,
                            error = %error,
                            "Render task failed"
                        );
                        result.failure_count += 1;
                        result.errors.push(BatchFailure { label, key, error });
                    }
                }
            }

            completed = result.success_count + result.failure_count;
            on_progress(BatchProgress { completed, total });
        }

        info!(
            target = TARGET,
            op = "batch::run",
            result = if result.failure_count == 0 { "ok" } else { "partial" },
            total,
            completed,
            rendered = result.rendered_count(),
            skipped = result.skipped_count,
            failed = result.failure_count,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Render batch finished"
        );
        result
    }
}

async fn execute(renderer: &dyn CardRenderer, task: BatchTask) -> Result<TaskOutcome, BatchTaskError> {
    if artifact_exists(&task.output).await? {
        return Ok(TaskOutcome::Skipped);
    }
    let bytes = renderer.render(&task.task).await?;
    write_artifact(&task.output, &bytes).await?;
    Ok(TaskOutcome::Rendered)
}
