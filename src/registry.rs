//! Authoritative project registry.
//!
//! Maps project ids to their workspace and lifecycle status. SQLite is the
//! only copy of that state: every read goes to the database, and every
//! status change is a conditional `UPDATE ... WHERE status = <expected>`,
//! so the server and `grh` CLI processes sharing one database see each
//! other's changes at once and can never both win the same transition.
//!
//! # State machine
//!
//! ```text
//! created ──▶ indexing ──▶ indexed
//!                 ▲  │        │
//!                 │  ▼        │
//!            index_failed     │
//!                 ▲           │
//!                 └── indexing ◀┘  (reindex)
//! ```
//!
//! [`ProjectRegistry::set_status`] (and its `mark_*` wrappers) is the only
//! way status changes. Queries are only served from `indexed`.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;

use crate::error::{ProjectError, Result};
use crate::locks::ProjectLocks;
use crate::migrate;
use crate::models::{LlmProvider, Project, ProjectStatus, DEFAULT_OUTPUT_DIR};

/// Reason recorded for runs cut short by a process restart.
pub const INTERRUPTED: &str = "interrupted: the service stopped while indexing";

pub struct ProjectRegistry {
    pool: SqlitePool,
}

/// Field changes applied together with a status transition.
#[derive(Default)]
struct StatusUpdate {
    output_dir: Option<String>,
    last_error: Option<String>,
}

impl ProjectRegistry {
    /// Open the registry, creating its table if needed.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Fail every run left `indexing` by a process that is gone.
    ///
    /// A row counts as interrupted only when nobody holds its run lock; a
    /// run still alive in another process keeps its lock and is skipped.
    /// Returns the recovered ids.
    pub async fn recover_interrupted(&self, locks: &ProjectLocks) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM projects WHERE status = ? ORDER BY seq ASC")
                .bind(ProjectStatus::Indexing.as_str())
                .fetch_all(&self.pool)
                .await?;

        let mut recovered = Vec::new();
        for id in ids {
            let Some(_guard) = locks.try_run(&id)? else {
                tracing::debug!(project_id = %id, "indexing run owned by a live process");
                continue;
            };
            match self.mark_failed(&id, INTERRUPTED).await {
                Ok(_) => {
                    tracing::warn!(project_id = %id, "recovered interrupted indexing run");
                    recovered.push(id);
                }
                // finished or deleted between the scan and the lock
                Err(ProjectError::InvalidTransition { .. }) | Err(ProjectError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Register a new project at status `created`.
    pub async fn register(
        &self,
        project_id: &str,
        workspace_path: PathBuf,
        provider: LlmProvider,
    ) -> Result<Project> {
        let now = now_secs();
        let project = Project {
            id: project_id.to_string(),
            workspace_path,
            status: ProjectStatus::Created,
            provider,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            last_error: None,
            created_at: from_secs(now),
            updated_at: from_secs(now),
        };

        let inserted = sqlx::query(
            "INSERT INTO projects (id, workspace_path, status, provider, output_dir, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(&project.id)
        .bind(project.workspace_path.to_string_lossy().to_string())
        .bind(project.status.as_str())
        .bind(project.provider.as_str())
        .bind(&project.output_dir)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(ProjectError::AlreadyRegistered(project_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(project_id = %project.id, "project registered");
        Ok(project)
    }

    pub async fn get(&self, project_id: &str) -> Result<Project> {
        let row = sqlx::query(
            "SELECT id, workspace_path, status, provider, output_dir, last_error, created_at, updated_at \
             FROM projects WHERE id = ?",
        )
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProjectError::NotFound(project_id.to_string()))?;
        project_from_row(&row)
    }

    /// Project ids in registration order.
    pub async fn list(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM projects ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Move a project to `status`.
    ///
    /// Fails with [`ProjectError::AlreadyIndexing`] for `indexing -> indexing`
    /// and [`ProjectError::InvalidTransition`] for any other transition the
    /// state machine does not allow. Entering `indexing` clears
    /// `last_error`.
    pub async fn set_status(&self, project_id: &str, status: ProjectStatus) -> Result<Project> {
        self.transition(project_id, status, StatusUpdate::default())
            .await
    }

    /// `indexing -> indexed`, recording where the artifacts were written.
    pub async fn mark_indexed(&self, project_id: &str, output_dir: &str) -> Result<Project> {
        self.transition(
            project_id,
            ProjectStatus::Indexed,
            StatusUpdate {
                output_dir: Some(output_dir.to_string()),
                last_error: None,
            },
        )
        .await
    }

    /// `indexing -> index_failed`, recording the cause.
    pub async fn mark_failed(&self, project_id: &str, reason: &str) -> Result<Project> {
        self.transition(
            project_id,
            ProjectStatus::IndexFailed,
            StatusUpdate {
                output_dir: None,
                last_error: Some(reason.to_string()),
            },
        )
        .await
    }

    async fn transition(
        &self,
        project_id: &str,
        status: ProjectStatus,
        update: StatusUpdate,
    ) -> Result<Project> {
        let current = self.get(project_id).await?;
        check_transition(&current, status)?;

        let mut next = current.clone();
        next.status = status;
        if let Some(dir) = update.output_dir {
            next.output_dir = dir;
        }
        next.last_error = if status == ProjectStatus::Indexing {
            None
        } else {
            update.last_error.or(next.last_error)
        };
        let now = now_secs();
        next.updated_at = from_secs(now);

        let result = sqlx::query(
            "UPDATE projects SET status = ?, output_dir = ?, last_error = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(next.status.as_str())
        .bind(&next.output_dir)
        .bind(&next.last_error)
        .bind(now)
        .bind(project_id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Another writer changed the row after it was read.
            let winner = self.get(project_id).await?;
            check_transition(&winner, status)?;
            return Err(ProjectError::InvalidTransition {
                project_id: project_id.to_string(),
                from: winner.status,
                to: status,
            });
        }

        tracing::info!(project_id, from = %current.status, to = %status, "status changed");
        Ok(next)
    }

    /// Remove a project's entry, returning it.
    pub async fn unregister(&self, project_id: &str) -> Result<Project> {
        let project = self.get(project_id).await?;
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProjectError::NotFound(project_id.to_string()));
        }
        tracing::info!(project_id, "project unregistered");
        Ok(project)
    }
}

fn check_transition(current: &Project, status: ProjectStatus) -> Result<()> {
    if current.status == ProjectStatus::Indexing && status == ProjectStatus::Indexing {
        return Err(ProjectError::AlreadyIndexing(current.id.clone()));
    }
    if !current.status.can_transition_to(status) {
        return Err(ProjectError::InvalidTransition {
            project_id: current.id.clone(),
            from: current.status,
            to: status,
        });
    }
    Ok(())
}

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let provider: String = row.get("provider");
    let workspace_path: String = row.get("workspace_path");
    let created_at: i64 = row.get("created_at");
    let updated_at: i64 = row.get("updated_at");

    let status = status.parse::<ProjectStatus>().map_err(|e| {
        ProjectError::Database(sqlx::Error::Decode(format!("project {}: {}", id, e).into()))
    })?;
    let provider = provider.parse::<LlmProvider>().map_err(|e| {
        ProjectError::Database(sqlx::Error::Decode(format!("project {}: {}", id, e).into()))
    })?;

    Ok(Project {
        id,
        workspace_path: PathBuf::from(workspace_path),
        status,
        provider,
        output_dir: row.get("output_dir"),
        last_error: row.get("last_error"),
        created_at: from_secs(created_at),
        updated_at: from_secs(updated_at),
    })
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn from_secs(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}
