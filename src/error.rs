//! Error types for project lifecycle, indexing, and querying.
//!
//! [`ProjectError`] is the domain error returned by every component
//! operation. The HTTP layer maps its variants onto status codes (see
//! [`crate::server`]); the CLI wraps it in `anyhow`.
//!
//! [`EngineError`] describes failures of the external graph engine and is
//! always carried as the `source` of a [`ProjectError`] so the underlying
//! cause survives for diagnostics.

use thiserror::Error;

use crate::models::ProjectStatus;

/// Errors surfaced by the registry, workspace store, materializer,
/// orchestrator, and dispatcher.
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(String),

    #[error("workspace already exists for project {0}")]
    WorkspaceExists(String),

    #[error("project already registered: {0}")]
    AlreadyRegistered(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("no API key in request and no default credential configured")]
    MissingCredential,

    #[error("invalid status transition for project {project_id}: {from} -> {to}")]
    InvalidTransition {
        project_id: String,
        from: ProjectStatus,
        to: ProjectStatus,
    },

    #[error("project {0} is already indexing")]
    AlreadyIndexing(String),

    #[error("project {project_id} has not been indexed (status: {status})")]
    NotIndexed {
        project_id: String,
        status: ProjectStatus,
    },

    #[error("invalid query method: '{0}' (expected 'global' or 'local')")]
    InvalidMethod(String),

    #[error("indexing failed for project {project_id}: {source}")]
    Indexing {
        project_id: String,
        #[source]
        source: EngineError,
    },

    #[error("query failed: {0}")]
    Query(#[source] EngineError),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to write settings: {0}")]
    Settings(#[from] serde_yaml::Error),
}

impl ProjectError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ProjectError::NotFound(_) => "not_found",
            ProjectError::WorkspaceExists(_) | ProjectError::AlreadyRegistered(_) => "conflict",
            ProjectError::InvalidInput(_) => "invalid_input",
            ProjectError::ConfigValidation(_) => "config_validation",
            ProjectError::MissingCredential => "missing_credential",
            ProjectError::InvalidTransition { .. } => "invalid_transition",
            ProjectError::AlreadyIndexing(_) => "already_indexing",
            ProjectError::NotIndexed { .. } => "not_indexed",
            ProjectError::InvalidMethod(_) => "invalid_method",
            ProjectError::Indexing { .. } => "indexing_failed",
            ProjectError::Query(_) => "query_failed",
            ProjectError::Io(_) | ProjectError::Database(_) | ProjectError::Settings(_) => {
                "internal"
            }
        }
    }
}

/// Failures reported by the external indexing / query engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to launch engine `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine exited with {code}: {stderr}")]
    Failed { code: String, stderr: String },

    #[error("engine timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = ProjectError> = std::result::Result<T, E>;
