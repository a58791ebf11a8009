//! External graph-engine seams.
//!
//! Entity extraction, graph construction, community summarization, and
//! retrieval all happen inside an external engine. This module defines the
//! contract the orchestrator and dispatcher rely on:
//!
//! - [`IndexEngine`]: consumes a workspace (input documents + settings) and
//!   writes artifacts into an output directory, or fails.
//! - [`QueryEngine`]: consumes indexed artifacts, a question, and a
//!   [`QueryMethod`], and returns generated answer text.
//!
//! [`GraphRagCli`] implements both by running the `graphrag` command line
//! tool as a child process. Tests substitute in-process stubs.
//!
//! ```text
//! ┌───────────┐  IndexRequest   ┌──────────────┐
//! │  Indexer  │────────────────▶│              │
//! └───────────┘                 │  IndexEngine │──▶ graphrag index --root …
//! ┌───────────┐  QueryRequest   │  QueryEngine │──▶ graphrag query --root …
//! │ Dispatcher│────────────────▶│              │
//! └───────────┘                 └──────────────┘
//! ```

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::QueryMethod;

/// Input to one indexing run.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub project_id: String,
    /// Workspace root (contains `input/` and `settings.yaml`).
    pub root: PathBuf,
    /// Absolute artifact directory for this run.
    pub output_dir: PathBuf,
    pub verbose: bool,
    pub dry_run: bool,
    pub memory_profile: bool,
}

/// What the engine reported on success.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    /// Trailing engine output, for logs and responses.
    pub log: String,
}

/// Input to one query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub project_id: String,
    pub root: PathBuf,
    /// Artifact directory produced by the last successful run.
    pub data_dir: PathBuf,
    pub query: String,
    pub method: QueryMethod,
    pub community_level: u32,
    pub response_type: String,
}

/// Runs the indexing pipeline over a workspace.
#[async_trait]
pub trait IndexEngine: Send + Sync {
    async fn index(&self, request: &IndexRequest) -> Result<IndexReport, EngineError>;
}

/// Answers a question from indexed artifacts.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, request: &QueryRequest) -> Result<String, EngineError>;
}

/// The pair of engines a [`crate::lifecycle::ProjectManager`] runs with.
#[derive(Clone)]
pub struct Engines {
    pub index: Arc<dyn IndexEngine>,
    pub query: Arc<dyn QueryEngine>,
}

impl Engines {
    /// Both roles served by one implementation.
    pub fn shared<E>(engine: Arc<E>) -> Self
    where
        E: IndexEngine + QueryEngine + 'static,
    {
        Self {
            index: engine.clone(),
            query: engine,
        }
    }

    /// The `graphrag` command line tool, as configured in `[engine]`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::shared(Arc::new(GraphRagCli::new(config)))
    }
}

// ============ graphrag CLI ============

/// Maximum number of bytes of engine output kept for reports and errors.
const OUTPUT_TAIL_BYTES: usize = 4096;

/// Engine backed by the `graphrag` executable.
///
/// The child is killed if the calling future is dropped (e.g. on timeout).
pub struct GraphRagCli {
    program: String,
    leading_args: Vec<String>,
}

impl GraphRagCli {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            leading_args: config.args.clone(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<String, EngineError> {
        let output = cmd.output().await.map_err(|source| EngineError::Launch {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let code = output
                .status
                .code()
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "signal".to_string());
            let detail = if stderr.trim().is_empty() {
                tail(&stdout)
            } else {
                tail(&stderr)
            };
            return Err(EngineError::Failed {
                code,
                stderr: detail,
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl IndexEngine for GraphRagCli {
    async fn index(&self, request: &IndexRequest) -> Result<IndexReport, EngineError> {
        let mut cmd = self.command();
        cmd.arg("index")
            .arg("--root")
            .arg(&request.root)
            .arg("--output")
            .arg(&request.output_dir);
        if request.verbose {
            cmd.arg("--verbose");
        }
        if request.dry_run {
            cmd.arg("--dry-run");
        }
        if request.memory_profile {
            cmd.arg("--memprofile");
        }

        let stdout = self.run(cmd).await?;
        Ok(IndexReport { log: tail(&stdout) })
    }
}

#[async_trait]
impl QueryEngine for GraphRagCli {
    async fn query(&self, request: &QueryRequest) -> Result<String, EngineError> {
        let mut cmd = self.command();
        cmd.arg("query")
            .arg("--root")
            .arg(&request.root)
            .arg("--data")
            .arg(&request.data_dir)
            .arg("--method")
            .arg(request.method.as_str())
            .arg("--community-level")
            .arg(request.community_level.to_string())
            .arg("--response-type")
            .arg(&request.response_type)
            .arg("--query")
            .arg(&request.query);

        let stdout = self.run(cmd).await?;
        Ok(stdout.trim().to_string())
    }
}

/// Last [`OUTPUT_TAIL_BYTES`] of `text`, cut on a char boundary.
fn tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= OUTPUT_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - OUTPUT_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
