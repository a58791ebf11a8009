//! Indexing orchestration.
//!
//! Drives the external [`IndexEngine`] over a project's workspace and keeps
//! the registry in step with the run:
//!
//! ```text
//! begin():   validate options → project + workspace + settings exist
//!            → per-project run lock → status = indexing
//! execute(): exclusive artifact lock (waits for in-flight queries)
//!            → global permit → clear output dir → engine (with timeout)
//!            → status = indexed | index_failed
//! ```
//!
//! [`Indexer::begin`] is cheap and returns once the run is visible as
//! `indexing`, so callers can hand [`IndexRun::execute`] to a background
//! task and answer immediately. [`Indexer::run`] does both in one call.
//!
//! Runs for the same project are mutually exclusive across processes (a
//! second caller gets [`ProjectError::AlreadyIndexing`]); runs for
//! different projects only share the `engine.max_concurrent_runs`
//! semaphore.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::config::EngineConfig;
use crate::engine::{IndexEngine, IndexReport, IndexRequest};
use crate::error::{EngineError, ProjectError, Result};
use crate::locks::{ProjectLocks, RunGuard};
use crate::models::{IndexOptions, ProjectStatus};
use crate::registry::ProjectRegistry;
use crate::settings::ConfigHandle;
use crate::workspace::{WorkspaceHandle, WorkspaceStore};

/// Reason recorded when a run's task is dropped before it finished.
pub const ABANDONED: &str = "indexing run was abandoned before completion";

// ============ Orchestrator ============

/// Result of a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub project_id: String,
    pub status: ProjectStatus,
    pub dry_run: bool,
    pub output_dir: String,
    pub elapsed_ms: u64,
    pub log: String,
}

#[derive(Clone)]
pub struct Indexer {
    registry: Arc<ProjectRegistry>,
    workspaces: Arc<WorkspaceStore>,
    engine: Arc<dyn IndexEngine>,
    locks: ProjectLocks,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl Indexer {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        workspaces: Arc<WorkspaceStore>,
        engine: Arc<dyn IndexEngine>,
        locks: ProjectLocks,
        config: &EngineConfig,
    ) -> Self {
        let timeout = match config.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            registry,
            workspaces,
            engine,
            locks,
            permits: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            timeout,
        }
    }

    /// Override the per-call engine timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the pipeline to completion.
    pub async fn run(&self, project_id: &str, options: IndexOptions) -> Result<IndexOutcome> {
        self.begin(project_id, options).await?.execute().await
    }

    /// Validate, lock, and move the project to `indexing`.
    ///
    /// Nothing is changed when this fails. Dry runs take the lock but leave
    /// the status alone.
    pub async fn begin(&self, project_id: &str, options: IndexOptions) -> Result<IndexRun> {
        let output_dir = options.output_dir()?;
        let project = self.registry.get(project_id).await?;
        let workspace = self.workspaces.handle(project_id)?;
        ConfigHandle::existing(&workspace)?;

        let guard = self
            .locks
            .try_run(project_id)?
            .ok_or_else(|| ProjectError::AlreadyIndexing(project_id.to_string()))?;

        if !options.dry_run {
            self.registry
                .set_status(project_id, ProjectStatus::Indexing)
                .await?;
        }

        tracing::info!(
            project_id,
            previous = %project.status,
            dry_run = options.dry_run,
            output_dir = %output_dir,
            "indexing run started"
        );

        Ok(IndexRun {
            project_id: project_id.to_string(),
            options,
            output_dir,
            workspace,
            indexer: self.clone(),
            started: Instant::now(),
            finished: false,
            guard: Some(guard),
        })
    }
}

/// A run that has been admitted and is visible as `indexing`.
///
/// If it is dropped before [`execute`](IndexRun::execute) finishes, the
/// project is moved to `index_failed` so it never stays stuck.
pub struct IndexRun {
    project_id: String,
    options: IndexOptions,
    output_dir: String,
    workspace: WorkspaceHandle,
    indexer: Indexer,
    started: Instant,
    finished: bool,
    guard: Option<RunGuard>,
}

impl IndexRun {
    /// Invoke the engine and record the result.
    ///
    /// On engine failure the project becomes `index_failed` and the cause is
    /// returned inside [`ProjectError::Indexing`].
    pub async fn execute(mut self) -> Result<IndexOutcome> {
        let result = self.invoke().await;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let registry = self.indexer.registry.clone();

        match result {
            Ok(report) => {
                let status = if self.options.dry_run {
                    registry.get(&self.project_id).await?.status
                } else {
                    registry
                        .mark_indexed(&self.project_id, &self.output_dir)
                        .await?
                        .status
                };
                self.finished = true;
                tracing::info!(
                    project_id = %self.project_id,
                    elapsed_ms,
                    dry_run = self.options.dry_run,
                    "indexing run succeeded"
                );
                Ok(IndexOutcome {
                    project_id: self.project_id.clone(),
                    status,
                    dry_run: self.options.dry_run,
                    output_dir: self.output_dir.clone(),
                    elapsed_ms,
                    log: report.log,
                })
            }
            Err(source) => {
                tracing::error!(
                    project_id = %self.project_id,
                    elapsed_ms,
                    error = %source,
                    "indexing run failed"
                );
                if !self.options.dry_run {
                    registry
                        .mark_failed(&self.project_id, &source.to_string())
                        .await?;
                }
                self.finished = true;
                Err(ProjectError::Indexing {
                    project_id: self.project_id.clone(),
                    source,
                })
            }
        }
    }

    async fn invoke(&self) -> Result<IndexReport, EngineError> {
        let indexer = &self.indexer;
        let _artifacts = if self.options.dry_run {
            None
        } else {
            Some(
                indexer
                    .locks
                    .write_artifacts(&self.project_id)
                    .await
                    .map_err(|e| EngineError::Other(format!("failed to lock artifacts: {}", e)))?,
            )
        };
        let _permit = indexer
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Other("indexing permits closed".to_string()))?;

        let output_dir = if self.options.dry_run {
            self.workspace.output_dir(&self.output_dir)
        } else {
            indexer
                .workspaces
                .reset_output(&self.project_id, &self.output_dir)
                .map_err(|e| {
                    EngineError::Other(format!("failed to prepare output directory: {}", e))
                })?
        };

        let request = IndexRequest {
            project_id: self.project_id.clone(),
            root: self.workspace.root.clone(),
            output_dir,
            verbose: self.options.verbose,
            dry_run: self.options.dry_run,
            memory_profile: self.options.memory_profile,
        };

        let call = indexer.engine.index(&request);
        match indexer.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(EngineError::Timeout(limit.as_secs()))),
            None => call.await,
        }
    }
}

impl Drop for IndexRun {
    fn drop(&mut self) {
        if self.finished || self.options.dry_run {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        tracing::warn!(
            project_id = %self.project_id,
            "indexing run dropped before completion"
        );
        let registry = self.indexer.registry.clone();
        let project_id = self.project_id.clone();
        // the run lock is held until the failure is recorded
        let guard = self.guard.take();
        runtime.spawn(async move {
            if let Err(e) = registry.mark_failed(&project_id, ABANDONED).await {
                tracing::error!(project_id = %project_id, error = %e, "failed to record abandoned run");
            }
            drop(guard);
        });
    }
}
