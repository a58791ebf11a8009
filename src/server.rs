//! REST server for project lifecycle, indexing, and querying.
//!
//! Every handler is a thin adapter over [`ProjectManager`]; the domain
//! errors it returns are mapped onto HTTP status codes in one place.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST`   | `/create_project` | Allocate a project (201) |
//! | `POST`   | `/upload_txt/{project_id}` | Add input documents (multipart) |
//! | `POST`   | `/index/{project_id}` | Run indexing (200), or start it with `{"background": true}` (202) |
//! | `POST`   | `/query/{project_id}` | Ask a question (`global` or `local`) |
//! | `GET`    | `/project/{project_id}` | Status and input documents |
//! | `DELETE` | `/project/{project_id}` | Remove the project |
//! | `GET`    | `/projects` | List project ids |
//! | `GET`    | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_indexed", "message": "project ... has not been indexed (status: created)" } }
//! ```
//!
//! | Status | Codes |
//! |--------|-------|
//! | 400 | `invalid_input`, `config_validation`, `missing_credential`, `invalid_method`, `not_indexed` |
//! | 404 | `not_found` |
//! | 409 | `already_indexing`, `invalid_transition`, `conflict` |
//! | 500 | `indexing_failed`, `query_failed`, `internal` |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::Engines;
use crate::error::ProjectError;
use crate::indexer::{IndexOutcome, IndexRun};
use crate::lifecycle::{CreateProject, ProjectInfo, ProjectManager, UploadFile, UploadReport};
use crate::models::{IndexOptions, LlmConfig, LlmProvider, ProjectStatus, QueryMethod};
use crate::query::QueryAnswer;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    manager: Arc<ProjectManager>,
}

/// Starts the HTTP server with the `graphrag` command line engine.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_engines(config, Engines::from_config(&config.engine)).await
}

/// Starts the HTTP server with caller-supplied engines.
pub async fn run_server_with_engines(config: &Config, engines: Engines) -> anyhow::Result<()> {
    let manager = Arc::new(ProjectManager::open(config, engines).await?);
    let app = router(manager, config);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    println!("GraphRAG server listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router around an open [`ProjectManager`].
pub fn router(manager: Arc<ProjectManager>, config: &Config) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/create_project", post(handle_create_project))
        .route("/upload_txt/{project_id}", post(handle_upload))
        .route("/index/{project_id}", post(handle_index))
        .route("/query/{project_id}", post(handle_query))
        .route(
            "/project/{project_id}",
            get(handle_project).delete(handle_delete),
        )
        .route("/projects", get(handle_list_projects))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(config.server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { manager })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"not_found"`, `"already_indexing"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ProjectError> for AppError {
    fn from(err: ProjectError) -> Self {
        let status = match &err {
            ProjectError::NotFound(_) => StatusCode::NOT_FOUND,
            ProjectError::InvalidInput(_)
            | ProjectError::ConfigValidation(_)
            | ProjectError::MissingCredential
            | ProjectError::InvalidMethod(_)
            | ProjectError::NotIndexed { .. } => StatusCode::BAD_REQUEST,
            ProjectError::AlreadyIndexing(_)
            | ProjectError::InvalidTransition { .. }
            | ProjectError::WorkspaceExists(_)
            | ProjectError::AlreadyRegistered(_) => StatusCode::CONFLICT,
            ProjectError::Indexing { .. }
            | ProjectError::Query(_)
            | ProjectError::Io(_)
            | ProjectError::Database(_)
            | ProjectError::Settings(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_input".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Parse a JSON body, reporting malformed input through the error contract
/// rather than axum's plain-text rejection.
fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid request body: {}", e)))
}

/// Like [`json_body`], but an empty body yields `T::default()`.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    json_body(body)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /create_project ============

/// Request body for `POST /create_project`.
#[derive(Deserialize)]
struct CreateProjectRequest {
    #[serde(default)]
    text_content: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    /// `openai` (default) or `azure`.
    #[serde(default)]
    llm: Option<String>,
    #[serde(default)]
    azure_api_base: Option<String>,
    #[serde(default)]
    azure_api_version: Option<String>,
    #[serde(default)]
    azure_deployment_name: Option<String>,
    #[serde(default)]
    azure_embedding_deployment_name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    embedding_model: Option<String>,
}

impl CreateProjectRequest {
    fn into_command(self) -> Result<CreateProject, ProjectError> {
        let provider = match self.llm.as_deref() {
            None => LlmProvider::default(),
            Some(name) => name.parse()?,
        };
        Ok(CreateProject {
            text_content: self.text_content,
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

#[derive(Serialize)]
struct CreateProjectResponse {
    project_id: String,
    message: String,
}

async fn handle_create_project(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateProjectResponse>), AppError> {
    let request: CreateProjectRequest = json_body(&body)?;
    let command = request.into_command()?;
    let project = state.manager.create_project(command).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            message: format!("Project {} created", project.id),
            project_id: project.id,
        }),
    ))
}

// ============ POST /upload_txt/{project_id} ============

#[derive(Serialize)]
struct UploadResponse {
    project_id: String,
    message: String,
    results: UploadReport,
}

/// Handler for `POST /upload_txt/{project_id}`.
///
/// Every multipart field carrying a file name is stored as one document.
/// When no file could be stored the same per-file report comes back with
/// status `400`.
async fn handle_upload(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    // Unknown projects are 404 before reading the body.
    state.manager.project(&project_id).await?;

    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content = field
            .bytes()
            .await
            .map_err(|e| bad_request(format!("failed to read {}: {}", filename, e)))?;
        files.push(UploadFile {
            filename,
            content: content.to_vec(),
        });
    }

    let report = state.manager.upload(&project_id, files).await?;
    let (status, message) = if report.successful.is_empty() {
        (StatusCode::BAD_REQUEST, "No files were uploaded".to_string())
    } else {
        (
            StatusCode::OK,
            format!(
                "{} file(s) uploaded, {} failed",
                report.successful.len(),
                report.failed.len()
            ),
        )
    };

    let body = UploadResponse {
        project_id,
        message,
        results: report,
    };
    Ok((status, Json(body)).into_response())
}

// ============ POST /index/{project_id} ============

/// Optional body for `POST /index/{project_id}`. Unknown fields are rejected.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct IndexBody {
    /// Respond once the run has started instead of when it finishes.
    #[serde(default)]
    background: bool,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    verbose: bool,
    #[serde(default)]
    memory_profile: bool,
    #[serde(default)]
    output_dir: Option<String>,
}

#[derive(Serialize)]
struct IndexStarted {
    project_id: String,
    status: ProjectStatus,
    message: String,
}

#[derive(Serialize)]
struct IndexCompleted {
    message: String,
    #[serde(flatten)]
    outcome: IndexOutcome,
}

/// Handler for `POST /index/{project_id}`.
///
/// The run executes on its own task in both modes, so a client that
/// disconnects never leaves the project stuck in `indexing`.
async fn handle_index(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body: IndexBody = optional_json(&body)?;
    let options = IndexOptions {
        dry_run: body.dry_run,
        verbose: body.verbose,
        memory_profile: body.memory_profile,
        output_dir: body.output_dir,
    };

    let run = state.manager.start_index(&project_id, options).await?;

    if body.background {
        spawn_background(run, project_id.clone(), body.dry_run);
        let status = state.manager.project(&project_id).await?.status;
        let started = IndexStarted {
            message: format!("Indexing started for project {}", project_id),
            project_id,
            status,
        };
        return Ok((StatusCode::ACCEPTED, Json(started)).into_response());
    }

    let outcome = tokio::spawn(run.execute())
        .await
        .map_err(|e| internal(format!("indexing task failed: {}", e)))??;
    let message = if outcome.dry_run {
        format!("Dry run completed for project {}", outcome.project_id)
    } else {
        format!("Indexing completed for project {}", outcome.project_id)
    };
    Ok(Json(IndexCompleted { message, outcome }).into_response())
}

/// Execute an admitted run on its own task, logging how it ended.
///
/// Non-dry failures are also recorded on the project; for a dry run this
/// log line is the only record.
fn spawn_background(run: IndexRun, project_id: String, dry_run: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        match run.execute().await {
            Ok(outcome) => tracing::info!(
                project_id = %project_id,
                dry_run,
                status = %outcome.status,
                elapsed_ms = outcome.elapsed_ms,
                "background indexing run finished"
            ),
            Err(e) => tracing::error!(
                project_id = %project_id,
                dry_run,
                code = e.code(),
                error = %e,
                "background indexing run failed"
            ),
        }
    })
}

// ============ POST /query/{project_id} ============

#[derive(Deserialize)]
struct QueryBody {
    #[serde(default)]
    query: String,
    #[serde(default = "default_method")]
    method: String,
}

fn default_method() -> String {
    QueryMethod::Global.as_str().to_string()
}

async fn handle_query(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    body: Bytes,
) -> Result<Json<QueryAnswer>, AppError> {
    let body: QueryBody = json_body(&body)?;
    let answer = state
        .manager
        .query(&project_id, &body.query, &body.method)
        .await?;
    Ok(Json(answer))
}

// ============ /project/{project_id} ============

async fn handle_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectInfo>, AppError> {
    Ok(Json(state.manager.project_info(&project_id).await?))
}

#[derive(Serialize)]
struct DeleteResponse {
    project_id: String,
    message: String,
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    state.manager.delete_project(&project_id).await?;
    Ok(Json(DeleteResponse {
        message: format!("Project {} deleted", project_id),
        project_id,
    }))
}

// ============ GET /projects ============

#[derive(Serialize)]
struct ProjectListResponse {
    projects: Vec<String>,
}

async fn handle_list_projects(
    State(state): State<AppState>,
) -> Result<Json<ProjectListResponse>, AppError> {
    Ok(Json(ProjectListResponse {
        projects: state.manager.list_projects().await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubEngine;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_background_dry_run_failure_is_logged() {
        let logs = Captured::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.llm.api_key = Some("sk-test".into());
        let engine = Arc::new(StubEngine::default());
        let manager = ProjectManager::open(&config, Engines::shared(engine.clone()))
            .await
            .unwrap();
        let project = manager
            .create_project(CreateProject {
                text_content: Some("text".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        engine.fail(Some("bad settings"));
        let options = IndexOptions {
            dry_run: true,
            ..Default::default()
        };
        let run = manager.start_index(&project.id, options).await.unwrap();
        spawn_background(run, project.id.clone(), true).await.unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("background indexing run failed"))
            .unwrap_or_else(|| panic!("no failure logged:\n{}", output));
        assert!(line.contains(&project.id));
        assert!(line.contains("dry_run=true"));
        assert!(line.contains("bad settings"));
        assert_eq!(
            manager.project(&project.id).await.unwrap().status,
            ProjectStatus::Created
        );
    }
}
