//! Per-project file locks shared by every process using one workspace root.
//!
//! The server and any number of `grh` CLI invocations can point at the same
//! registry, so in-process mutexes are not enough. Each project gets two
//! advisory lock files under `<workspace root>/.locks`:
//!
//! | File | Held by | Mode |
//! |------|---------|------|
//! | `<id>.run` | an indexing run or a deletion | exclusive, never waits |
//! | `<id>.artifacts` | a query reading the output directory | shared, never waits |
//! | `<id>.artifacts` | a run clearing and rewriting it | exclusive, waits for readers |
//!
//! Locks belong to the open file, so they are released when the guard is
//! dropped or when the holding process exits.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use crate::error::{ProjectError, Result};

const RUN: &str = "run";
const ARTIFACTS: &str = "artifacts";

#[derive(Clone, Debug)]
pub struct ProjectLocks {
    dir: PathBuf,
}

/// Holds a project's run lock until dropped.
#[derive(Debug)]
pub struct RunGuard {
    _file: File,
}

/// Holds a shared or exclusive artifact lock until dropped.
#[derive(Debug)]
pub struct ArtifactGuard {
    _file: File,
}

impl ProjectLocks {
    /// Use `dir` for lock files, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Take the run lock for `project_id`, or `None` if any process holds it.
    pub fn try_run(&self, project_id: &str) -> Result<Option<RunGuard>> {
        let file = self.lock_file(project_id, RUN)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RunGuard { _file: file })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether some process currently holds the run lock for `project_id`.
    pub fn is_running(&self, project_id: &str) -> Result<bool> {
        Ok(self.try_run(project_id)?.is_none())
    }

    /// Shared artifact lock for a reader, or `None` while a run holds it
    /// exclusively.
    pub fn try_read_artifacts(&self, project_id: &str) -> Result<Option<ArtifactGuard>> {
        let file = self.lock_file(project_id, ARTIFACTS)?;
        match FileExt::try_lock_shared(&file) {
            Ok(()) => Ok(Some(ArtifactGuard { _file: file })),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Exclusive artifact lock. Waits until every reader has let go.
    pub async fn write_artifacts(&self, project_id: &str) -> Result<ArtifactGuard> {
        let file = self.lock_file(project_id, ARTIFACTS)?;
        let file = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
            .await
            .map_err(io::Error::other)??;
        Ok(ArtifactGuard { _file: file })
    }

    /// Remove a deleted project's lock files. Call while holding its run lock.
    pub fn forget(&self, project_id: &str) {
        for kind in [ARTIFACTS, RUN] {
            let Ok(path) = self.path(project_id, kind) else {
                return;
            };
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(project_id, path = %path.display(), error = %e, "failed to remove lock file")
                }
            }
        }
    }

    fn path(&self, project_id: &str, kind: &str) -> Result<PathBuf> {
        let well_formed = !project_id.is_empty()
            && project_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(ProjectError::InvalidInput(format!(
                "malformed project id: {:?}",
                project_id
            )));
        }
        Ok(self.dir.join(format!("{}.{}", project_id, kind)))
    }

    fn lock_file(&self, project_id: &str, kind: &str) -> Result<File> {
        let path = self.path(project_id, kind)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(file)
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
