//! Project lifecycle: create, upload, inspect, and delete.
//!
//! [`ProjectManager`] is the entry point used by both the HTTP server and
//! the CLI. It owns the registry, workspace store, materializer, indexer,
//! and dispatcher, and keeps the registry and the on-disk workspace in step:
//!
//! - **create**: validate LLM settings → allocate id → create workspace →
//!   write initial text → materialize settings → register. Any failure
//!   removes the workspace again, so a project is either fully visible or
//!   not at all.
//! - **delete**: refused while the project is indexing in any process;
//!   removes the workspace, then the registry entry.
//!
//! Opening a manager also fails any run left `indexing` by a process that
//! exited mid-run (see [`ProjectRegistry::recover_interrupted`]).

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::engine::Engines;
use crate::error::{ProjectError, Result};
use crate::indexer::{IndexOutcome, IndexRun, Indexer};
use crate::locks::ProjectLocks;
use crate::models::{IndexOptions, LlmConfig, LlmProvider, Project, ProjectStatus};
use crate::query::{QueryAnswer, QueryDispatcher};
use crate::registry::ProjectRegistry;
use crate::settings::SettingsMaterializer;
use crate::workspace::{WorkspaceHandle, WorkspaceStore};

/// Name of the document holding text supplied at creation time.
pub const INITIAL_TEXT_FILE: &str = "source_text.txt";

/// Parameters for [`ProjectManager::create_project`].
#[derive(Debug, Clone, Default)]
pub struct CreateProject {
    /// Written as the first input document when not blank.
    pub text_content: Option<String>,
    pub llm: LlmConfig,
}

/// One uploaded document.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadReport {
    /// Names the documents were stored under.
    pub successful: Vec<String>,
    pub failed: Vec<UploadFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub filename: String,
    pub reason: String,
}

/// Status view of a project, used for polling.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub project_id: String,
    pub status: ProjectStatus,
    pub provider: LlmProvider,
    pub output_dir: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub input_documents: Vec<String>,
}

pub struct ProjectManager {
    registry: Arc<ProjectRegistry>,
    workspaces: Arc<WorkspaceStore>,
    materializer: SettingsMaterializer,
    indexer: Indexer,
    dispatcher: QueryDispatcher,
    locks: ProjectLocks,
}

impl ProjectManager {
    /// Connect to the registry database and workspace root named in `config`.
    pub async fn open(config: &Config, engines: Engines) -> anyhow::Result<Self> {
        let pool = db::connect(&config.db.path)
            .await
            .with_context(|| format!("Failed to open registry: {}", config.db.path.display()))?;
        let registry = ProjectRegistry::open(pool)
            .await
            .context("Failed to load project registry")?;
        let lock_dir = config.db.lock_dir();
        let locks = ProjectLocks::open(&lock_dir)
            .with_context(|| format!("Failed to open lock directory: {}", lock_dir.display()))?;
        let recovered = registry
            .recover_interrupted(&locks)
            .await
            .context("Failed to recover interrupted runs")?;
        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "marked interrupted runs as failed");
        }
        let workspaces = WorkspaceStore::open(&config.workspace.root).with_context(|| {
            format!(
                "Failed to open workspace root: {}",
                config.workspace.root.display()
            )
        })?;
        let materializer =
            SettingsMaterializer::new(config.llm.clone(), config.chunking.clone());

        Ok(Self::from_parts(
            Arc::new(registry),
            Arc::new(workspaces),
            materializer,
            engines,
            locks,
            config,
        ))
    }

    pub fn from_parts(
        registry: Arc<ProjectRegistry>,
        workspaces: Arc<WorkspaceStore>,
        materializer: SettingsMaterializer,
        engines: Engines,
        locks: ProjectLocks,
        config: &Config,
    ) -> Self {
        let indexer = Indexer::new(
            registry.clone(),
            workspaces.clone(),
            engines.index,
            locks.clone(),
            &config.engine,
        );
        let dispatcher = QueryDispatcher::new(
            registry.clone(),
            engines.query,
            locks.clone(),
            config.query.clone(),
        );
        Self {
            registry,
            workspaces,
            materializer,
            indexer,
            dispatcher,
            locks,
        }
    }

    /// Create a project, rolling back every step if any of them fails.
    pub async fn create_project(&self, request: CreateProject) -> Result<Project> {
        // Reject bad provider settings before anything touches disk.
        self.materializer.resolve(&request.llm)?;

        let project_id = Uuid::new_v4().to_string();
        let workspace = self.workspaces.create(&project_id)?;

        match self.populate(&workspace, &request).await {
            Ok(project) => {
                tracing::info!(
                    project_id = %project.id,
                    provider = %project.provider,
                    "project created"
                );
                Ok(project)
            }
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "project creation failed, rolling back");
                if let Err(cleanup) = self.workspaces.delete(&project_id, false) {
                    tracing::error!(
                        project_id = %project_id,
                        error = %cleanup,
                        "failed to remove workspace during rollback"
                    );
                }
                Err(e)
            }
        }
    }

    async fn populate(&self, workspace: &WorkspaceHandle, request: &CreateProject) -> Result<Project> {
        let project_id = &workspace.project_id;
        if let Some(text) = request.text_content.as_deref() {
            if !text.trim().is_empty() {
                self.workspaces
                    .write_input(project_id, INITIAL_TEXT_FILE, text.as_bytes())?;
            }
        }
        self.materializer.materialize(workspace, &request.llm)?;
        self.registry
            .register(project_id, workspace.root.clone(), request.llm.provider)
            .await
    }

    /// Add documents to a project's input corpus.
    ///
    /// Each file succeeds or fails on its own; the report lists both.
    pub async fn upload(&self, project_id: &str, files: Vec<UploadFile>) -> Result<UploadReport> {
        self.registry.get(project_id).await?;
        if files.is_empty() {
            return Err(ProjectError::InvalidInput("no files supplied".to_string()));
        }

        let mut report = UploadReport::default();
        for file in files {
            match self
                .workspaces
                .write_input(project_id, &file.filename, &file.content)
            {
                Ok(stored) => report.successful.push(stored),
                Err(e) => {
                    tracing::warn!(project_id, filename = %file.filename, error = %e, "upload rejected");
                    report.failed.push(UploadFailure {
                        filename: file.filename,
                        reason: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            project_id,
            successful = report.successful.len(),
            failed = report.failed.len(),
            "upload processed"
        );
        Ok(report)
    }

    /// Remove a project's workspace and registry entry.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        self.registry.get(project_id).await?;
        let _guard = self
            .locks
            .try_run(project_id)?
            .ok_or_else(|| ProjectError::AlreadyIndexing(project_id.to_string()))?;
        // Re-read under the lock; another process may have moved it.
        let project = self.registry.get(project_id).await?;
        if project.status == ProjectStatus::Indexing {
            return Err(ProjectError::AlreadyIndexing(project_id.to_string()));
        }

        let result = match self.workspaces.delete(project_id, true) {
            Ok(()) => {
                self.registry.unregister(project_id).await?;
                tracing::info!(project_id, "project deleted");
                Ok(())
            }
            Err(ProjectError::NotFound(reason)) => {
                // Storage and registry disagreed; drop the dangling entry.
                tracing::warn!(project_id, %reason, "registered project had no workspace");
                self.registry.unregister(project_id).await?;
                Err(ProjectError::NotFound(reason))
            }
            Err(e) => return Err(e),
        };
        self.locks.forget(project_id);
        result
    }

    /// Project ids in creation order.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        self.registry.list().await
    }

    pub async fn project(&self, project_id: &str) -> Result<Project> {
        self.registry.get(project_id).await
    }

    pub async fn project_info(&self, project_id: &str) -> Result<ProjectInfo> {
        let project = self.registry.get(project_id).await?;
        let input_documents = match self.workspaces.list_inputs(project_id) {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(project_id, error = %e, "could not list input documents");
                Vec::new()
            }
        };
        Ok(ProjectInfo {
            project_id: project.id,
            status: project.status,
            provider: project.provider,
            output_dir: project.output_dir,
            last_error: project.last_error,
            created_at: project.created_at,
            updated_at: project.updated_at,
            input_documents,
        })
    }

    /// Run indexing to completion.
    pub async fn index(&self, project_id: &str, options: IndexOptions) -> Result<IndexOutcome> {
        self.indexer.run(project_id, options).await
    }

    /// Admit a run without executing it; see [`Indexer::begin`].
    pub async fn start_index(&self, project_id: &str, options: IndexOptions) -> Result<IndexRun> {
        self.indexer.begin(project_id, options).await
    }

    pub async fn query(&self, project_id: &str, query_text: &str, method: &str) -> Result<QueryAnswer> {
        self.dispatcher.query(project_id, query_text, method).await
    }
}
