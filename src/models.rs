//! Core data models used throughout GraphRAG Harness.
//!
//! These types describe projects, their lifecycle status, the LLM provider
//! settings materialized into each workspace, and the options recognized by
//! the indexing and query operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::ProjectError;

/// Default artifact directory inside a workspace.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// Lifecycle status of a project.
///
/// ```text
/// created ──▶ indexing ──▶ indexed
///                │  ▲          │
///                ▼  │          │
///           index_failed ◀─────┘ (via indexing)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Indexing,
    Indexed,
    IndexFailed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Indexing => "indexing",
            ProjectStatus::Indexed => "indexed",
            ProjectStatus::IndexFailed => "index_failed",
        }
    }

    /// Whether the registry may move a project from `self` to `next`.
    ///
    /// `indexed -> indexing` is a reindex; `index_failed -> indexing` is a
    /// retry.
    pub fn can_transition_to(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, next),
            (Created, Indexing)
                | (Indexing, Indexed)
                | (Indexing, IndexFailed)
                | (IndexFailed, Indexing)
                | (Indexed, Indexing)
        )
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ProjectStatus::Created),
            "indexing" => Ok(ProjectStatus::Indexing),
            "indexed" => Ok(ProjectStatus::Indexed),
            "index_failed" => Ok(ProjectStatus::IndexFailed),
            other => Err(format!("unknown project status: {}", other)),
        }
    }
}

/// A registered project.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub workspace_path: PathBuf,
    pub status: ProjectStatus,
    pub provider: LlmProvider,
    /// Artifact directory (relative to the workspace) of the last
    /// successful run.
    pub output_dir: String,
    /// Cause of the last failed run, cleared when a new run starts.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// LLM provider backing a project's indexing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    Openai,
    Azure,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Openai => "openai",
            LlmProvider::Azure => "azure",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProvider {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::Openai),
            "azure" => Ok(LlmProvider::Azure),
            other => Err(ProjectError::ConfigValidation(format!(
                "unknown llm provider '{}'; expected 'openai' or 'azure'",
                other
            ))),
        }
    }
}

/// Creation-time LLM settings for a project.
///
/// Azure fields are required together when `provider` is [`LlmProvider::Azure`];
/// the materializer enforces this.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub azure_api_base: Option<String>,
    pub azure_api_version: Option<String>,
    pub azure_deployment_name: Option<String>,
    pub azure_embedding_deployment_name: Option<String>,
    /// Chat model override; falls back to `[llm].chat_model`.
    pub model: Option<String>,
    /// Embedding model override; falls back to `[llm].embedding_model`.
    pub embedding_model: Option<String>,
}

/// Retrieval method for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMethod {
    /// Community-summary driven, broad questions.
    Global,
    /// Entity-neighborhood driven, specific questions.
    Local,
}

impl QueryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMethod::Global => "global",
            QueryMethod::Local => "local",
        }
    }
}

impl fmt::Display for QueryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMethod {
    type Err = ProjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(QueryMethod::Global),
            "local" => Ok(QueryMethod::Local),
            other => Err(ProjectError::InvalidMethod(other.to_string())),
        }
    }
}

/// Recognized per-run indexing knobs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexOptions {
    /// Validate the configuration without running the pipeline. Status is
    /// left untouched.
    #[serde(default)]
    pub dry_run: bool,
    /// Ask the engine for verbose logging.
    #[serde(default)]
    pub verbose: bool,
    /// Ask the engine to profile memory usage.
    #[serde(default)]
    pub memory_profile: bool,
    /// Artifact directory relative to the workspace. Defaults to `output`.
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl IndexOptions {
    /// Resolve and validate the artifact directory.
    ///
    /// Only plain relative paths are accepted so artifacts always stay
    /// inside the project's workspace.
    pub fn output_dir(&self) -> Result<String, ProjectError> {
        let Some(raw) = self.output_dir.as_deref() else {
            return Ok(DEFAULT_OUTPUT_DIR.to_string());
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(DEFAULT_OUTPUT_DIR.to_string());
        }
        let path = Path::new(trimmed);
        let plain = path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(ProjectError::InvalidInput(format!(
                "output_dir must be a relative path inside the workspace: {}",
                raw
            )));
        }
        if trimmed == "input" || trimmed.starts_with("input/") {
            return Err(ProjectError::InvalidInput(
                "output_dir must not point into input/".to_string(),
            ));
        }
        Ok(trimmed.to_string())
    }
}
