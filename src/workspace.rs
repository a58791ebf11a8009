//! On-disk project workspaces.
//!
//! Every project owns one directory under the configured workspace root:
//!
//! ```text
//! <root>/<project_id>/
//!   input/          # text documents fed to the engine
//!   output/         # engine artifacts (reserved until indexed)
//!   settings.yaml   # engine settings (see crate::settings)
//!   .env            # engine credentials
//! ```
//!
//! The directory is the unit of backup, restore, and deletion. Only the
//! [`WorkspaceStore`] creates or removes it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::error::{ProjectError, Result};
use crate::models::DEFAULT_OUTPUT_DIR;

pub const INPUT_DIR: &str = "input";
pub const SETTINGS_FILE: &str = "settings.yaml";
pub const ENV_FILE: &str = ".env";

/// Paths of one project's workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceHandle {
    pub project_id: String,
    pub root: PathBuf,
}

impl WorkspaceHandle {
    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR)
    }

    pub fn output_dir(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn env_path(&self) -> PathBuf {
        self.root.join(ENV_FILE)
    }
}

/// Owner of the per-project directory trees.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Open the store, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
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
        Ok(self.root.join(project_id))
    }

    pub fn exists(&self, project_id: &str) -> bool {
        self.project_dir(project_id)
            .map(|dir| dir.is_dir())
            .unwrap_or(false)
    }

    /// Allocate a fresh workspace with `input/` and a reserved `output/`.
    pub fn create(&self, project_id: &str) -> Result<WorkspaceHandle> {
        let dir = self.project_dir(project_id)?;

        // create_dir (not create_dir_all) so an existing directory is a hard error
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ProjectError::WorkspaceExists(project_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let handle = WorkspaceHandle {
            project_id: project_id.to_string(),
            root: dir,
        };
        let populate = fs::create_dir(handle.input_dir())
            .and_then(|_| fs::create_dir(handle.output_dir(DEFAULT_OUTPUT_DIR)));
        if let Err(e) = populate {
            let _ = fs::remove_dir_all(&handle.root);
            return Err(e.into());
        }

        Ok(handle)
    }

    /// Handle for an existing workspace.
    pub fn handle(&self, project_id: &str) -> Result<WorkspaceHandle> {
        let dir = self.project_dir(project_id)?;
        if !dir.is_dir() {
            return Err(ProjectError::NotFound(project_id.to_string()));
        }
        Ok(WorkspaceHandle {
            project_id: project_id.to_string(),
            root: dir,
        })
    }

    /// Store a text document in `input/`, returning the name it was stored
    /// under.
    ///
    /// Existing files are never overwritten: on collision the name gets a
    /// numeric suffix (`notes.txt`, `notes-1.txt`, `notes-2.txt`, ...).
    pub fn write_input(&self, project_id: &str, filename: &str, content: &[u8]) -> Result<String> {
        let handle = self.handle(project_id)?;
        let name = sanitize_filename(filename)?;

        let text = std::str::from_utf8(content).map_err(|_| {
            ProjectError::InvalidInput(format!("{} is not valid UTF-8 text", name))
        })?;
        if text.contains('\0') {
            return Err(ProjectError::InvalidInput(format!(
                "{} contains binary data",
                name
            )));
        }

        let input_dir = handle.input_dir();
        fs::create_dir_all(&input_dir)?;

        let (stem, ext) = split_name(&name);
        for n in 0u32.. {
            let candidate = if n == 0 {
                name.clone()
            } else {
                match ext {
                    Some(ext) => format!("{}-{}.{}", stem, n, ext),
                    None => format!("{}-{}", stem, n),
                }
            };
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(input_dir.join(&candidate))
            {
                Ok(mut file) => {
                    file.write_all(content)?;
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("u32 range exhausted while naming an input file")
    }

    /// Names of the documents currently in `input/`, sorted.
    pub fn list_inputs(&self, project_id: &str) -> Result<Vec<String>> {
        let handle = self.handle(project_id)?;
        let input_dir = handle.input_dir();
        if !input_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&input_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                ProjectError::Io(
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk failed")),
                )
            })?;
            if entry.file_type().is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(names)
    }

    /// Empty (or create) an artifact directory before a run writes to it.
    pub fn reset_output(&self, project_id: &str, relative: &str) -> Result<PathBuf> {
        let handle = self.handle(project_id)?;
        let dir = handle.output_dir(relative);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Recursively remove a workspace.
    ///
    /// A missing workspace is fine when nothing expects it
    /// (`expect_present == false`); when the registry still holds an entry
    /// for it, the disagreement is reported as [`ProjectError::NotFound`].
    pub fn delete(&self, project_id: &str, expect_present: bool) -> Result<()> {
        let dir = self.project_dir(project_id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if expect_present {
                    Err(ProjectError::NotFound(format!(
                        "workspace for project {} is missing",
                        project_id
                    )))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reduce an uploaded name to a safe final path component.
fn sanitize_filename(filename: &str) -> Result<String> {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(ProjectError::InvalidInput(format!(
            "invalid file name: {:?}",
            filename
        )));
    }
    if base.chars().any(|c| c.is_control()) {
        return Err(ProjectError::InvalidInput(format!(
            "file name contains control characters: {:?}",
            filename
        )));
    }
    Ok(base.to_string())
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    }
}
