//! Question answering over indexed projects.
//!
//! The dispatcher only delegates to the [`QueryEngine`] when the registry
//! says the project is `indexed`; every other status is refused with
//! [`ProjectError::NotIndexed`] so stale or partial artifacts are never
//! read. It never changes status or artifacts.
//!
//! The status check and the engine call both happen under a shared
//! artifact lock. A reindex admitted meanwhile waits for that lock before
//! it clears the output directory, so an answer is always computed from one
//! complete set of artifacts.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::config::QueryConfig;
use crate::engine::{QueryEngine, QueryRequest};
use crate::error::{ProjectError, Result};
use crate::locks::ProjectLocks;
use crate::models::{ProjectStatus, QueryMethod};
use crate::registry::ProjectRegistry;

/// Answer returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub project_id: String,
    pub query: String,
    pub method: QueryMethod,
    pub answer: String,
}

#[derive(Clone)]
pub struct QueryDispatcher {
    registry: Arc<ProjectRegistry>,
    engine: Arc<dyn QueryEngine>,
    locks: ProjectLocks,
    config: QueryConfig,
}

impl QueryDispatcher {
    pub fn new(
        registry: Arc<ProjectRegistry>,
        engine: Arc<dyn QueryEngine>,
        locks: ProjectLocks,
        config: QueryConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            locks,
            config,
        }
    }

    /// Answer `query_text` from the project's artifacts.
    ///
    /// Checks, in order: the project exists, it is `indexed`, `method` is
    /// `global` or `local`, the query is not blank. The engine's answer is
    /// returned verbatim; engine failures surface as [`ProjectError::Query`].
    pub async fn query(&self, project_id: &str, query_text: &str, method: &str) -> Result<QueryAnswer> {
        self.registry.get(project_id).await?;
        let Some(_artifacts) = self.locks.try_read_artifacts(project_id)? else {
            // a run is rewriting the output directory
            return Err(ProjectError::NotIndexed {
                project_id: project_id.to_string(),
                status: ProjectStatus::Indexing,
            });
        };
        let project = self.registry.get(project_id).await?;
        if project.status != ProjectStatus::Indexed {
            return Err(ProjectError::NotIndexed {
                project_id: project_id.to_string(),
                status: project.status,
            });
        }

        let method: QueryMethod = method.parse()?;
        if query_text.trim().is_empty() {
            return Err(ProjectError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }

        let request = QueryRequest {
            project_id: project_id.to_string(),
            root: project.workspace_path.clone(),
            data_dir: project.workspace_path.join(&project.output_dir),
            query: query_text.to_string(),
            method,
            community_level: self.config.community_level,
            response_type: self.config.response_type.clone(),
        };

        let started = Instant::now();
        let answer = self.engine.query(&request).await.map_err(|e| {
            tracing::error!(project_id, method = %method, error = %e, "query failed");
            ProjectError::Query(e)
        })?;
        tracing::info!(
            project_id,
            method = %method,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "query answered"
        );

        Ok(QueryAnswer {
            project_id: project_id.to_string(),
            query: query_text.to_string(),
            method,
            answer,
        })
    }
}
