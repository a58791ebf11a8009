//! End-to-end tests for the HTTP server.
//!
//! Each test starts the server on a free port with an in-process engine in
//! place of the `graphrag` executable and drives it over HTTP.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use graphrag_harness::config::{parse_config, Config};
use graphrag_harness::engine::{
    Engines, IndexEngine, IndexReport, IndexRequest, QueryEngine, QueryRequest,
};
use graphrag_harness::error::EngineError;
use graphrag_harness::server::run_server_with_engines;

// ─── Test engine ────────────────────────────────────────────────────

/// Engine that answers every question with a fixed string.
#[derive(Default)]
struct ScriptedEngine {
    answer: String,
    fail_with: Mutex<Option<String>>,
    /// When set, indexing waits until a permit is available.
    gate: Option<Arc<Semaphore>>,
    index_calls: AtomicUsize,
}

impl ScriptedEngine {
    fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl IndexEngine for ScriptedEngine {
    async fn index(&self, request: &IndexRequest) -> Result<IndexReport, EngineError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _open = gate.acquire().await;
        }
        if let Some(reason) = self.fail_with.lock().unwrap().clone() {
            return Err(EngineError::Other(reason));
        }
        if !request.dry_run {
            std::fs::write(request.output_dir.join("entities.parquet"), b"test")
                .map_err(|e| EngineError::Other(e.to_string()))?;
        }
        Ok(IndexReport {
            log: "pipeline complete".to_string(),
        })
    }
}

#[async_trait]
impl QueryEngine for ScriptedEngine {
    async fn query(&self, _request: &QueryRequest) -> Result<String, EngineError> {
        Ok(self.answer.clone())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir, port: u16) -> Config {
    let root = tmp.path();
    let content = format!(
        r#"[db]
path = "{}/registry.sqlite"

[workspace]
root = "{}/projects"

[server]
bind = "127.0.0.1:{}"

[engine]
timeout_secs = 30

[llm]
api_key_env = "GRH_INTEGRATION_UNSET_KEY"
"#,
        root.display(),
        root.display(),
        port
    );
    parse_config(&content).unwrap()
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

struct TestServer {
    _tmp: TempDir,
    base: String,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(engine: Arc<ScriptedEngine>) -> Self {
        let port = find_free_port();
        let tmp = TempDir::new().unwrap();
        let cfg = test_config(&tmp, port);

        let handle = tokio::spawn(async move {
            run_server_with_engines(&cfg, Engines::shared(engine))
                .await
                .ok();
        });
        wait_for_server(port).await;

        Self {
            _tmp: tmp,
            base: format!("http://127.0.0.1:{}", port),
            client: reqwest::Client::new(),
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post_json(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn get_json(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn delete(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.delete(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap())
    }

    async fn create(&self, text: &str) -> String {
        let (status, body) = self
            .post_json(
                "/create_project",
                json!({ "text_content": text, "llm": "openai", "api_key": "sk-test" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {body}");
        body["project_id"].as_str().unwrap().to_string()
    }

    async fn status_of(&self, project_id: &str) -> String {
        let (_, body) = self.get_json(&format!("/project/{}", project_id)).await;
        body["status"].as_str().unwrap_or_default().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;
    let (status, body) = server.get_json("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

/// Create → index → query, the path every client takes.
#[tokio::test]
async fn test_create_index_query() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;

    let id = server.create("The sky is blue.").await;
    assert!(uuid::Uuid::parse_str(&id).is_ok(), "not a uuid: {id}");
    assert_eq!(server.status_of(&id).await, "created");

    let (status, body) = server
        .post_json(
            &format!("/query/{}", id),
            json!({ "query": "What color is the sky?", "method": "global" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "not_indexed");

    let resp = server
        .client
        .post(server.url(&format!("/index/{}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "indexed");
    assert_eq!(body["output_dir"], "output");

    let (status, body) = server
        .post_json(
            &format!("/query/{}", id),
            json!({ "query": "What color is the sky?", "method": "global" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], "blue");
    assert_eq!(body["method"], "global");
    assert_eq!(body["project_id"], id.as_str());

    let (_, info) = server.get_json(&format!("/project/{}", id)).await;
    assert_eq!(info["status"], "indexed");
    assert_eq!(info["input_documents"], json!(["source_text.txt"]));

    let (_, list) = server.get_json("/projects").await;
    assert_eq!(list["projects"], json!([id]));
}

#[tokio::test]
async fn test_query_errors() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;

    let (status, body) = server
        .post_json("/query/no-such-project", json!({ "query": "q", "method": "global" }))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let id = server.create("text").await;
    let (status, _) = server.post_json(&format!("/index/{}", id), json!({})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server
        .post_json(&format!("/query/{}", id), json!({ "query": "q", "method": "drift" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_method");

    let (status, body) = server
        .post_json(&format!("/query/{}", id), json!({ "query": "  ", "method": "local" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");
}

#[tokio::test]
async fn test_create_validation() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;

    // Azure without api_version / deployment
    let (status, body) = server
        .post_json(
            "/create_project",
            json!({
                "text_content": "text",
                "llm": "azure",
                "api_key": "sk-test",
                "azure_api_base": "https://example.openai.azure.com"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "config_validation");

    // No key in the request and no default configured
    let (status, body) = server
        .post_json("/create_project", json!({ "text_content": "text" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "missing_credential");

    let (status, body) = server
        .post_json("/create_project", json!({ "llm": "anthropic", "api_key": "k" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "config_validation");

    let (_, list) = server.get_json("/projects").await;
    assert_eq!(list["projects"], json!([]));
}

/// Malformed JSON gets the same error body as every other 400.
#[tokio::test]
async fn test_malformed_json_bodies() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;
    let id = server.create("text").await;

    for path in [
        "/create_project".to_string(),
        format!("/query/{}", id),
        format!("/index/{}", id),
    ] {
        for raw in ["{not json", "[1, 2]", r#"{"text_content": 7, "query": 7}"#] {
            let resp = server
                .client
                .post(server.url(&path))
                .header("content-type", "application/json")
                .body(raw)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{} {}", path, raw);
            let body: Value = resp.json().await.unwrap();
            assert_eq!(body["error"]["code"], "invalid_input", "{} {}", path, raw);
        }
    }

    // no content type at all is still parsed
    let resp = server
        .client
        .post(server.url("/create_project"))
        .body(r#"{"text_content": "x", "api_key": "sk-test"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    assert_eq!(server.status_of(&id).await, "created");
}

#[tokio::test]
async fn test_upload_multipart() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;
    let id = server.create("first").await;

    let form = Form::new()
        .part(
            "files",
            Part::bytes(b"Alice works with Bob.".to_vec()).file_name("notes.txt"),
        )
        .part(
            "files",
            Part::bytes(b"Second copy.".to_vec()).file_name("notes.txt"),
        )
        .part(
            "files",
            Part::bytes(vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff]).file_name("logo.png"),
        );
    let resp = server
        .client
        .post(server.url(&format!("/upload_txt/{}", id)))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["results"]["successful"],
        json!(["notes.txt", "notes-1.txt"])
    );
    assert_eq!(body["results"]["failed"][0]["filename"], "logo.png");

    let (_, info) = server.get_json(&format!("/project/{}", id)).await;
    assert_eq!(
        info["input_documents"],
        json!(["notes-1.txt", "notes.txt", "source_text.txt"])
    );

    // Nothing stored
    let form = Form::new().part(
        "files",
        Part::bytes(vec![0x00, 0xff]).file_name("blob.bin"),
    );
    let resp = server
        .client
        .post(server.url(&format!("/upload_txt/{}", id)))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["project_id"], id.as_str());
    assert_eq!(body["results"]["successful"], json!([]));
    assert_eq!(body["results"]["failed"][0]["filename"], "blob.bin");
    assert!(body["results"]["failed"][0]["reason"]
        .as_str()
        .unwrap()
        .contains("UTF-8"));

    // Unknown project
    let form = Form::new().part("files", Part::bytes(b"x".to_vec()).file_name("a.txt"));
    let resp = server
        .client
        .post(server.url("/upload_txt/missing"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_index_failure_then_retry() {
    let engine = Arc::new(ScriptedEngine::answering("blue"));
    let server = TestServer::start(engine.clone()).await;
    let id = server.create("text").await;

    *engine.fail_with.lock().unwrap() = Some("rate limited".to_string());
    let (status, body) = server.post_json(&format!("/index/{}", id), json!({})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "indexing_failed");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("rate limited"));

    let (_, info) = server.get_json(&format!("/project/{}", id)).await;
    assert_eq!(info["status"], "index_failed");
    assert!(info["last_error"].as_str().unwrap().contains("rate limited"));

    *engine.fail_with.lock().unwrap() = None;
    let (status, body) = server.post_json(&format!("/index/{}", id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "indexed");

    let (_, info) = server.get_json(&format!("/project/{}", id)).await;
    assert!(info["last_error"].is_null());
}

#[tokio::test]
async fn test_index_options() {
    let engine = Arc::new(ScriptedEngine::answering("blue"));
    let server = TestServer::start(engine.clone()).await;
    let id = server.create("text").await;

    let (status, body) = server
        .post_json(&format!("/index/{}", id), json!({ "dry_run": true }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dry_run"], true);
    assert_eq!(server.status_of(&id).await, "created");

    let (status, body) = server
        .post_json(&format!("/index/{}", id), json!({ "threads": 4 }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");

    let (status, _) = server
        .post_json(&format!("/index/{}", id), json!({ "output_dir": "../escape" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server
        .post_json(
            &format!("/index/{}", id),
            json!({ "output_dir": "runs/first", "verbose": true }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output_dir"], "runs/first");

    let (_, info) = server.get_json(&format!("/project/{}", id)).await;
    assert_eq!(info["output_dir"], "runs/first");

    let (status, _) = server.post_json("/index/unknown", json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// A background run is visible as `indexing` and blocks a second run and
/// deletion until it finishes.
#[tokio::test]
async fn test_background_index_and_conflicts() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(ScriptedEngine {
        answer: "blue".to_string(),
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let server = TestServer::start(engine.clone()).await;
    let id = server.create("text").await;

    let (status, body) = server
        .post_json(&format!("/index/{}", id), json!({ "background": true }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "indexing");

    let (status, body) = server.post_json(&format!("/index/{}", id), json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_indexing");

    let (status, _) = server.delete(&format!("/project/{}", id)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = server
        .post_json(&format!("/query/{}", id), json!({ "query": "q" }))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "not_indexed");

    gate.add_permits(1);
    let mut status = String::new();
    for _ in 0..50 {
        status = server.status_of(&id).await;
        if status == "indexed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(status, "indexed");
    assert_eq!(engine.index_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_delete_project() {
    let server = TestServer::start(Arc::new(ScriptedEngine::answering("blue"))).await;
    let keep = server.create("keep").await;
    let gone = server.create("gone").await;

    let (status, body) = server.delete(&format!("/project/{}", gone)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["project_id"], gone.as_str());

    let (_, list) = server.get_json("/projects").await;
    assert_eq!(list["projects"], json!([keep]));

    let (status, body) = server.delete(&format!("/project/{}", gone)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = server.get_json(&format!("/project/{}", gone)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
