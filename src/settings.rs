//! Per-project engine configuration.
//!
//! [`SettingsMaterializer::materialize`] turns a project's [`LlmConfig`] into
//! the two artifacts the graphrag engine reads from its root directory:
//!
//! - `settings.yaml`: model, input, chunking, output, cache, and reporting
//!   sections. The API key is referenced as `${GRAPHRAG_API_KEY}`, never
//!   inlined.
//! - `.env`: `GRAPHRAG_API_KEY=<key>`, readable by the owner only on Unix.
//!
//! Validation happens before anything is written, so a rejected
//! configuration leaves the workspace untouched. Re-materializing
//! overwrites both files; a run already in progress keeps the settings it
//! started with.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{ChunkingConfig, LlmDefaults};
use crate::error::{ProjectError, Result};
use crate::models::{LlmConfig, LlmProvider, DEFAULT_OUTPUT_DIR};
use crate::workspace::{WorkspaceHandle, INPUT_DIR};

/// Variable name the settings file uses to reference the credential.
pub const API_KEY_VAR: &str = "GRAPHRAG_API_KEY";

/// Paths of the written configuration artifacts.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    pub settings_path: PathBuf,
    pub env_path: PathBuf,
}

impl ConfigHandle {
    /// Handle for a workspace whose settings and credentials must already
    /// exist.
    pub fn existing(workspace: &WorkspaceHandle) -> Result<Self> {
        let handle = Self {
            settings_path: workspace.settings_path(),
            env_path: workspace.env_path(),
        };
        for (path, what) in [
            (&handle.settings_path, "settings file"),
            (&handle.env_path, "credentials file"),
        ] {
            if !path.is_file() {
                return Err(ProjectError::ConfigValidation(format!(
                    "project {} has no {}",
                    workspace.project_id, what
                )));
            }
        }
        Ok(handle)
    }
}

/// A validated [`LlmConfig`] with its credential resolved.
#[derive(Debug, Clone)]
pub struct ResolvedLlm {
    pub provider: LlmProvider,
    pub api_key: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub azure: Option<AzureTarget>,
}

#[derive(Debug, Clone)]
pub struct AzureTarget {
    pub api_base: String,
    pub api_version: String,
    pub deployment_name: String,
    pub embedding_deployment_name: String,
}

/// Writes engine settings and credentials into workspaces.
#[derive(Debug, Clone)]
pub struct SettingsMaterializer {
    llm: LlmDefaults,
    chunking: ChunkingConfig,
    default_api_key: Option<String>,
}

impl SettingsMaterializer {
    pub fn new(llm: LlmDefaults, chunking: ChunkingConfig) -> Self {
        let default_api_key = llm.default_api_key();
        Self {
            llm,
            chunking,
            default_api_key,
        }
    }

    /// Replace the process-wide fallback credential.
    pub fn with_default_api_key(mut self, key: Option<String>) -> Self {
        self.default_api_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    /// Validate `config` and resolve its credential without touching disk.
    pub fn resolve(&self, config: &LlmConfig) -> Result<ResolvedLlm> {
        let azure = match config.provider {
            LlmProvider::Openai => None,
            LlmProvider::Azure => {
                let api_base = required(&config.azure_api_base, "azure_api_base")?;
                let api_version = required(&config.azure_api_version, "azure_api_version")?;
                let deployment_name =
                    required(&config.azure_deployment_name, "azure_deployment_name")?;
                let embedding_deployment_name = non_blank(&config.azure_embedding_deployment_name)
                    .unwrap_or_else(|| deployment_name.clone());
                Some(AzureTarget {
                    api_base,
                    api_version,
                    deployment_name,
                    embedding_deployment_name,
                })
            }
        };

        let api_key = non_blank(&config.api_key)
            .or_else(|| non_blank(&self.default_api_key))
            .ok_or(ProjectError::MissingCredential)?;
        // the key becomes one line of `.env`
        if api_key.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(ProjectError::ConfigValidation(
                "api_key must not contain whitespace or control characters".to_string(),
            ));
        }

        Ok(ResolvedLlm {
            provider: config.provider,
            api_key,
            chat_model: non_blank(&config.model).unwrap_or_else(|| self.llm.chat_model.clone()),
            embedding_model: non_blank(&config.embedding_model)
                .unwrap_or_else(|| self.llm.embedding_model.clone()),
            azure,
        })
    }

    /// Validate, then write `settings.yaml` and `.env` into the workspace.
    pub fn materialize(&self, workspace: &WorkspaceHandle, config: &LlmConfig) -> Result<ConfigHandle> {
        let resolved = self.resolve(config)?;
        let settings = self.render_settings(&resolved)?;

        let handle = ConfigHandle {
            settings_path: workspace.settings_path(),
            env_path: workspace.env_path(),
        };
        fs::write(&handle.settings_path, settings)?;
        write_secret(
            &handle.env_path,
            &format!("{}={}\n", API_KEY_VAR, resolved.api_key),
        )?;

        tracing::debug!(
            project_id = %workspace.project_id,
            provider = %resolved.provider,
            "materialized engine settings"
        );
        Ok(handle)
    }

    fn render_settings(&self, llm: &ResolvedLlm) -> Result<String> {
        let key_ref = format!("${{{}}}", API_KEY_VAR);
        let (chat_type, embedding_type) = match llm.provider {
            LlmProvider::Openai => ("openai_chat", "openai_embedding"),
            LlmProvider::Azure => ("azure_openai_chat", "azure_openai_embedding"),
        };
        let azure = llm.azure.as_ref();

        let settings = EngineSettings {
            models: Models {
                default_chat_model: ModelSettings {
                    kind: chat_type,
                    api_key: key_ref.clone(),
                    model: llm.chat_model.clone(),
                    api_base: azure.map(|a| a.api_base.clone()),
                    api_version: azure.map(|a| a.api_version.clone()),
                    deployment_name: azure.map(|a| a.deployment_name.clone()),
                    model_supports_json: Some(true),
                },
                default_embedding_model: ModelSettings {
                    kind: embedding_type,
                    api_key: key_ref,
                    model: llm.embedding_model.clone(),
                    api_base: azure.map(|a| a.api_base.clone()),
                    api_version: azure.map(|a| a.api_version.clone()),
                    deployment_name: azure.map(|a| a.embedding_deployment_name.clone()),
                    model_supports_json: None,
                },
            },
            input: InputSettings {
                kind: "file",
                file_type: "text",
                base_dir: INPUT_DIR,
                file_pattern: r".*\.txt$",
            },
            chunks: ChunkSettings {
                size: self.chunking.size,
                overlap: self.chunking.overlap,
            },
            output: StorageSettings {
                kind: "file",
                base_dir: DEFAULT_OUTPUT_DIR,
            },
            cache: StorageSettings {
                kind: "file",
                base_dir: "cache",
            },
            reporting: StorageSettings {
                kind: "file",
                base_dir: "logs",
            },
        };

        Ok(serde_yaml::to_string(&settings)?)
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required(value: &Option<String>, field: &str) -> Result<String> {
    non_blank(value).ok_or_else(|| {
        ProjectError::ConfigValidation(format!("{} is required when llm is 'azure'", field))
    })
}

#[cfg(unix)]
fn write_secret(path: &Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::fs::PermissionsExt;
    use std::io::Write;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_secret(path: &Path, content: &str) -> std::io::Result<()> {
    fs::write(path, content)
}

// ============ settings.yaml schema ============

#[derive(Serialize)]
struct EngineSettings {
    models: Models,
    input: InputSettings,
    chunks: ChunkSettings,
    output: StorageSettings,
    cache: StorageSettings,
    reporting: StorageSettings,
}

#[derive(Serialize)]
struct Models {
    default_chat_model: ModelSettings,
    default_embedding_model: ModelSettings,
}

#[derive(Serialize)]
struct ModelSettings {
    #[serde(rename = "type")]
    kind: &'static str,
    api_key: String,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deployment_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_supports_json: Option<bool>,
}

#[derive(Serialize)]
struct InputSettings {
    #[serde(rename = "type")]
    kind: &'static str,
    file_type: &'static str,
    base_dir: &'static str,
    file_pattern: &'static str,
}

#[derive(Serialize)]
struct ChunkSettings {
    size: usize,
    overlap: usize,
}

#[derive(Serialize)]
struct StorageSettings {
    #[serde(rename = "type")]
    kind: &'static str,
    base_dir: &'static str,
}
