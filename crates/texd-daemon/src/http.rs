//! HTTP ingress.
//!
//! Routes: `POST /compile` for compilation, `GET /health` for liveness and
//! queue depth, `GET /cache/stats` for cache counters. The compile handler
//! validates the request, enqueues a job, and waits on the job's reply
//! channel; the response is raw PDF bytes on success and a JSON error body
//! otherwise.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use texd_core::fileset::{self, FileEntry};

use crate::admission::{AdmissionQueue, CompileJob, EnqueueError};
use crate::cache::CompilationCache;
use crate::compile::{CompileResult, FailureKind};
use crate::error::ApiError;

/// Request body bound. Projects ship images and fonts inline, so this is
/// far above typical payloads while still bounding memory per request.
const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Shared state behind the router.
pub struct AppState {
    /// Admission queue feeding the worker pool.
    pub queue: AdmissionQueue,
    /// The compilation cache, for the stats endpoint.
    pub cache: Arc<CompilationCache>,
}

/// The compile request wire format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    /// Ordered file set.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Optional project id enabling the compile cache.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Advisory hint from the editor; the diff engine is authoritative.
    #[serde(default)]
    pub last_modified_file: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    queue_length: usize,
    queue_capacity: usize,
    timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompileFailureBody {
    error: &'static str,
    message: String,
    request_id: String,
    queue_ms: u64,
    duration_ms: u64,
    stdout: String,
    stderr: String,
    log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pdf_buffer: Option<String>,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/compile", post(compile_handler))
        .route("/health", get(health_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue_length: state.queue.queue_len(),
        queue_capacity: state.queue.queue_capacity(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn cache_stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.cache.stats().await).into_response()
}

async fn compile_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match handle_compile(&state, &body).await {
        Ok(result) => compile_response(result),
        Err(err) => err.into_response(),
    }
}

async fn handle_compile(state: &AppState, body: &Bytes) -> Result<CompileResult, ApiError> {
    let request: CompileRequest = serde_json::from_slice(body)
        .map_err(|err| ApiError::BadRequest(format!("could not parse JSON payload: {err}")))?;

    fileset::validate_files(&request.files)
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;

    if fileset::find_main_file(&request.files).is_none() {
        return Err(ApiError::NoMainFile);
    }

    if let Some(hint) = &request.last_modified_file {
        // Advisory only; the diff engine decides what actually changed.
        debug!(last_modified_file = %hint, "client change hint received");
    }

    let project_id = request
        .project_id
        .filter(|id| !id.is_empty());
    if let Some(project_id) = &project_id {
        debug!(project_id = %project_id, "compile request for project");
    }

    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    let job = CompileJob {
        files: request.files,
        project_id,
        enqueued_at: Instant::now(),
        reply: reply_tx,
    };

    state.queue.submit(job).await.map_err(|err| match err {
        EnqueueError::Full { queue_position } => ApiError::QueueFull { queue_position },
        EnqueueError::Timeout => ApiError::EnqueueTimeout,
        EnqueueError::Closed => ApiError::Internal("compile queue is shut down".to_string()),
    })?;

    reply_rx
        .await
        .map_err(|_| ApiError::Internal("worker dropped the reply channel".to_string()))
}

/// Map a worker result onto the wire: raw PDF on success, JSON otherwise.
fn compile_response(result: CompileResult) -> Response {
    let request_id = result.request_id;
    let queue_ms = result.queue_ms;
    let duration_ms = result.duration_ms;

    let mut response = if result.success {
        let sha256 = result.pdf_sha256;
        let mut response = (StatusCode::OK, result.pdf_data).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/pdf"),
        );
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"compiled.pdf\""),
        );
        insert_header(headers, "x-compile-sha256", &sha256);
        response
    } else {
        let status = match result.failure {
            Some(FailureKind::NoMainFile) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let pdf_buffer = if result.pdf_data.is_empty() {
            None
        } else {
            Some(base64::engine::general_purpose::STANDARD.encode(&result.pdf_data))
        };
        let body = CompileFailureBody {
            error: result.failure.map_or("INTERNAL", FailureKind::code),
            message: result.error_message,
            request_id: request_id.clone(),
            queue_ms,
            duration_ms,
            stdout: result.stdout,
            stderr: result.stderr,
            log: result.log_tail,
            pdf_buffer,
        };
        (status, Json(body)).into_response()
    };

    let headers = response.headers_mut();
    insert_header(headers, "x-compile-request-id", &request_id);
    insert_header(headers, "x-compile-queue-ms", &queue_ms.to_string());
    insert_header(headers, "x-compile-duration-ms", &duration_ms.to_string());

    response
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Permissive CORS for browser-based editors.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use async_trait::async_trait;

    use texd_core::toolchain::{ToolchainDriver, ToolchainOutput, ToolchainRequest};

    use crate::admission::AdmissionConfig;
    use crate::cache::{CacheConfig, CompilationCache};
    use crate::compile::CompileContext;

    #[derive(Debug)]
    struct PdfWritingDriver;

    #[async_trait]
    impl ToolchainDriver for PdfWritingDriver {
        async fn run(&self, request: &ToolchainRequest) -> io::Result<ToolchainOutput> {
            let pdf = request
                .workspace
                .join(&request.main_file)
                .with_extension("pdf");
            std::fs::write(&pdf, b"%PDF-1.5 handler test")?;
            Ok(ToolchainOutput {
                exit_code: 0,
                ..ToolchainOutput::default()
            })
        }
    }

    fn test_state() -> Arc<AppState> {
        let cache = Arc::new(CompilationCache::new(CacheConfig::default()));
        let ctx = Arc::new(CompileContext::new(
            Arc::clone(&cache),
            Arc::new(PdfWritingDriver),
        ));
        let (queue, _workers) = AdmissionQueue::start(&AdmissionConfig::default(), ctx);
        Arc::new(AppState { queue, cache })
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn rejects_unparseable_json() {
        let state = test_state();
        let response =
            compile_handler(State(state), Bytes::from_static(b"not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("BAD_REQUEST"));
    }

    #[tokio::test]
    async fn rejects_empty_file_set() {
        let state = test_state();
        let response =
            compile_handler(State(state), Bytes::from_static(b"{\"files\":[]}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_request_without_tex_source() {
        let state = test_state();
        let body = serde_json::json!({
            "files": [{"path": "refs.bib", "content": "@article{k}"}]
        });
        let response = compile_handler(
            State(state),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("NO_MAIN_FILE"));
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let state = test_state();
        let body = serde_json::json!({
            "files": [{"path": "../main.tex", "content": "\\documentclass{article}"}]
        });
        let response = compile_handler(
            State(state),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn successful_compile_returns_pdf_with_headers() {
        let state = test_state();
        let body = serde_json::json!({
            "files": [{
                "path": "main.tex",
                "content": "\\documentclass{article}\\begin{document}A\\end{document}"
            }]
        });
        let response = compile_handler(
            State(state),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/pdf"
        );
        assert!(response.headers().contains_key("x-compile-request-id"));
        assert!(response.headers().contains_key("x-compile-queue-ms"));
        assert!(response.headers().contains_key("x-compile-duration-ms"));
        assert!(response.headers().contains_key("x-compile-sha256"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn health_reports_queue_shape() {
        let state = test_state();
        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.queue_length, 0);
        assert_eq!(health.queue_capacity, 4);
    }

    #[tokio::test]
    async fn cache_stats_reports_defaults() {
        let state = test_state();
        let response = cache_stats_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains("\"maxEntries\":15"));
        assert!(body.contains("\"expirationMinutes\":30"));
    }

    #[tokio::test]
    async fn failed_compile_maps_to_json_error_body() {
        let result = CompileResult::failure(
            "req-1",
            FailureKind::Toolchain,
            "LaTeX toolchain exited with code 3",
            5,
            100,
        );
        let response = compile_response(result);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_string(response).await;
        assert!(body.contains("TOOLCHAIN_FAILURE"));
        assert!(body.contains("req-1"));
    }
}
