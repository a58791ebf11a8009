//! # GraphRAG Harness CLI (`grh`)
//!
//! The `grh` binary runs the REST server and offers the same project
//! operations from the command line.
//!
//! ## Usage
//!
//! ```bash
//! grh --config ./config/grh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `grh serve` | Start the HTTP server |
//! | `grh projects list` | List project ids |
//! | `grh projects show <id>` | Print a project's status and documents |
//! | `grh projects create` | Create a project |
//! | `grh projects delete <id>` | Delete a project |
//! | `grh upload <id> <files…>` | Add input documents |
//! | `grh index <id>` | Run indexing to completion |
//! | `grh query <id> "<question>"` | Ask a question |
//!
//! ## Examples
//!
//! ```bash
//! grh projects create --text "The sky is blue." --api-key sk-...
//! grh index 5f0c... --verbose
//! grh query 5f0c... "What color is the sky?" --method global
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use graphrag_harness::config;
use graphrag_harness::engine::Engines;
use graphrag_harness::lifecycle::{CreateProject, ProjectManager, UploadFile};
use graphrag_harness::models::{IndexOptions, LlmConfig, LlmProvider};
use graphrag_harness::server;

const DEFAULT_LOG_FILTER: &str = "graphrag_harness=info,tower_http=info";

/// GraphRAG Harness CLI: project-scoped GraphRAG indexing and question
/// answering.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/grh.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "grh",
    about = "GraphRAG Harness: project-scoped GraphRAG indexing and question answering",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/grh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Create, inspect, list, and delete projects.
    Projects {
        #[command(subcommand)]
        action: ProjectsAction,
    },

    /// Add text documents to a project's input corpus.
    Upload {
        project_id: String,
        /// Files to upload; each is stored under its file name.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run the indexing pipeline for a project and wait for it to finish.
    Index {
        project_id: String,

        /// Validate the configuration without running the pipeline.
        #[arg(long)]
        dry_run: bool,

        /// Ask the engine for verbose output.
        #[arg(long)]
        verbose: bool,

        /// Ask the engine to profile memory usage.
        #[arg(long)]
        memory_profile: bool,

        /// Artifact directory relative to the workspace (default `output`).
        #[arg(long)]
        output_dir: Option<String>,
    },

    /// Ask a question against an indexed project.
    Query {
        project_id: String,
        /// The question.
        query: String,
        /// Retrieval method: `global` or `local`.
        #[arg(long, default_value = "global")]
        method: String,
    },
}

#[derive(Subcommand)]
enum ProjectsAction {
    /// List project ids in creation order.
    List,
    /// Print a project's status, timestamps, and input documents as JSON.
    Show { project_id: String },
    /// Create a project and print its id.
    Create(CreateArgs),
    /// Delete a project's workspace and registry entry.
    Delete { project_id: String },
}

#[derive(Args)]
struct CreateArgs {
    /// Initial document text.
    #[arg(long, conflicts_with = "text_file")]
    text: Option<String>,
    /// Read the initial document from a file.
    #[arg(long)]
    text_file: Option<PathBuf>,
    /// LLM provider: `openai` or `azure`.
    #[arg(long, default_value = "openai")]
    llm: String,
    /// API key; falls back to `[llm].api_key` or `GRAPHRAG_API_KEY`.
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    azure_api_base: Option<String>,
    #[arg(long)]
    azure_api_version: Option<String>,
    #[arg(long)]
    azure_deployment_name: Option<String>,
    #[arg(long)]
    azure_embedding_deployment_name: Option<String>,
    /// Chat model override.
    #[arg(long)]
    model: Option<String>,
    /// Embedding model override.
    #[arg(long)]
    embedding_model: Option<String>,
}

impl CreateArgs {
    fn into_command(self) -> anyhow::Result<CreateProject> {
        let provider: LlmProvider = self.llm.parse()?;
        let text_content = match self.text_file {
            Some(path) => Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
            ),
            None => self.text,
        };
        Ok(CreateProject {
            text_content,
            llm: LlmConfig {
                provider,
                api_key: self.api_key,
                azure_api_base: self.azure_api_base,
                azure_api_version: self.azure_api_version,
                azure_deployment_name: self.azure_deployment_name,
                azure_embedding_deployment_name: self.azure_embedding_deployment_name,
                model: self.model,
                embedding_model: self.embedding_model,
            },
        })
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await,
        command => run_command(&cfg, command).await,
    }
}

/// Run a one-shot project command against the configured registry.
async fn run_command(cfg: &config::Config, command: Commands) -> anyhow::Result<()> {
    let manager = ProjectManager::open(cfg, Engines::from_config(&cfg.engine)).await?;

    match command {
        Commands::Serve => server::run_server(cfg).await?,
        Commands::Projects { action } => match action {
            ProjectsAction::List => {
                let ids = manager.list_projects().await?;
                if ids.is_empty() {
                    println!("No projects.");
                }
                for id in ids {
                    println!("{}", id);
                }
            }
            ProjectsAction::Show { project_id } => {
                let info = manager.project_info(&project_id).await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            ProjectsAction::Create(args) => {
                let project = manager.create_project(args.into_command()?).await?;
                println!("{}", project.id);
            }
            ProjectsAction::Delete { project_id } => {
                manager.delete_project(&project_id).await?;
                println!("Project {} deleted.", project_id);
            }
        },
        Commands::Upload { project_id, files } => {
            let mut uploads = Vec::with_capacity(files.len());
            for path in files {
                let content = std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                uploads.push(UploadFile { filename, content });
            }
            let report = manager.upload(&project_id, uploads).await?;
            for name in &report.successful {
                println!("stored   {}", name);
            }
            for failure in &report.failed {
                println!("rejected {} ({})", failure.filename, failure.reason);
            }
            if report.successful.is_empty() {
                anyhow::bail!("no files were uploaded");
            }
        }
        Commands::Index {
            project_id,
            dry_run,
            verbose,
            memory_profile,
            output_dir,
        } => {
            let options = IndexOptions {
                dry_run,
                verbose,
                memory_profile,
                output_dir,
            };
            let outcome = manager.index(&project_id, options).await?;
            if !outcome.log.is_empty() {
                println!("{}", outcome.log);
            }
            println!(
                "Project {}: {} ({} ms{})",
                outcome.project_id,
                outcome.status,
                outcome.elapsed_ms,
                if outcome.dry_run { ", dry run" } else { "" }
            );
        }
        Commands::Query {
            project_id,
            query,
            method,
        } => {
            let answer = manager.query(&project_id, &query, &method).await?;
            println!("{}", answer.answer);
        }
    }

    Ok(())
}
