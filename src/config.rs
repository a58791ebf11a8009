use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub workspace: WorkspaceConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub llm: LlmDefaults,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl DbConfig {
    /// Directory of per-project lock files, next to the database so every
    /// process sharing the registry also shares its locks.
    pub fn lock_dir(&self) -> PathBuf {
        self.path.with_extension("locks")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Directory holding one sub-directory per project.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Engine executable, resolved through `PATH`.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments placed before the subcommand (e.g. `["-m", "graphrag"]`
    /// when `program` is a Python interpreter).
    #[serde(default)]
    pub args: Vec<String>,
    /// Upper bound for one engine call. `0` disables the timeout.
    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of indexing runs executing at once across projects.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            timeout_secs: default_engine_timeout_secs(),
            max_concurrent_runs: default_max_concurrent_runs(),
        }
    }
}

fn default_program() -> String {
    "graphrag".to_string()
}
fn default_engine_timeout_secs() -> u64 {
    7200
}
fn default_max_concurrent_runs() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmDefaults {
    /// Process-wide fallback credential for projects created without a key.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable consulted when `api_key` is not set.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for LlmDefaults {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "GRAPHRAG_API_KEY".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

impl LlmDefaults {
    /// The default credential: `api_key` from the file, otherwise the
    /// environment variable named by `api_key_env`.
    pub fn default_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1200
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_community_level")]
    pub community_level: u32,
    #[serde(default = "default_response_type")]
    pub response_type: String,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            community_level: default_community_level(),
            response_type: default_response_type(),
        }
    }
}

fn default_community_level() -> u32 {
    2
}
fn default_response_type() -> String {
    "Multiple Paragraphs".to_string()
}

impl Config {
    /// A configuration rooted at `root`, with every optional section at its
    /// default. Used by tests and for ad-hoc runs.
    pub fn minimal(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("registry.sqlite"),
            },
            workspace: WorkspaceConfig {
                root: root.join("projects"),
            },
            server: ServerConfig {
                bind: "127.0.0.1:8000".to_string(),
                max_upload_bytes: default_max_upload_bytes(),
            },
            engine: EngineConfig::default(),
            llm: LlmDefaults::default(),
            chunking: ChunkingConfig::default(),
            query: QueryConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.size == 0 {
            anyhow::bail!("chunking.size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.size {
            anyhow::bail!("chunking.overlap must be smaller than chunking.size");
        }
        if self.engine.max_concurrent_runs == 0 {
            anyhow::bail!("engine.max_concurrent_runs must be >= 1");
        }
        if self.engine.program.trim().is_empty() {
            anyhow::bail!("engine.program must not be empty");
        }
        if self.query.response_type.trim().is_empty() {
            anyhow::bail!("query.response_type must not be empty");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[db]
path = "./data/registry.sqlite"

[workspace]
root = "./data/projects"

[server]
bind = "127.0.0.1:8000"
"#;

    #[test]
    fn test_defaults_fill_optional_sections() {
        let cfg = parse_config(BASE).unwrap();
        assert_eq!(cfg.engine.program, "graphrag");
        assert_eq!(cfg.engine.timeout_secs, 7200);
        assert_eq!(cfg.engine.max_concurrent_runs, 2);
        assert_eq!(cfg.chunking.size, 1200);
        assert_eq!(cfg.chunking.overlap, 100);
        assert_eq!(cfg.query.community_level, 2);
        assert_eq!(cfg.llm.api_key_env, "GRAPHRAG_API_KEY");
        assert_eq!(cfg.server.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.db.lock_dir(), PathBuf::from("./data/registry.locks"));
    }

    #[test]
    fn test_rejects_overlap_not_below_size() {
        let content = format!("{}\n[chunking]\nsize = 100\noverlap = 100\n", BASE);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let content = format!("{}\n[engine]\nmax_concurrent_runs = 0\n", BASE);
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn test_missing_required_section() {
        assert!(parse_config("[db]\npath = \"x\"\n").is_err());
    }

    #[test]
    fn test_default_api_key_prefers_file_value() {
        let llm = LlmDefaults {
            api_key: Some("sk-file".into()),
            api_key_env: "GRH_TEST_UNSET_VARIABLE".into(),
            ..Default::default()
        };
        assert_eq!(llm.default_api_key().as_deref(), Some("sk-file"));

        let llm = LlmDefaults {
            api_key: Some("   ".into()),
            api_key_env: "GRH_TEST_UNSET_VARIABLE".into(),
            ..Default::default()
        };
        assert_eq!(llm.default_api_key(), None);
    }
}
