//! Per-request compile pipeline.
//!
//! A compile session brackets one request: it takes the cache session
//! (and with it the project lock), serves a cached PDF when the content
//! fingerprint matches, otherwise materializes a workspace, invokes the
//! toolchain with the selected strategy, validates the output, and hands
//! the workspace over to the cache on success.

pub mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use texd_core::classifier::{self, EngineClassification};
use texd_core::fileset::{self, FileEntry};
use texd_core::strategy;
use texd_core::toolchain::{
    LOG_TAIL_LINES, MAX_LOG_CHARS, ToolchainDriver, ToolchainOutput, ToolchainRequest,
    exit_indicates_failure, tail_lines, truncate_tail,
};

use crate::cache::CompilationCache;
use crate::cache::session::{CacheSession, IncrementalWorkspace};
use crate::history::HistoryRecorder;

/// Internal failure taxonomy carried by failed results, mapped onto the
/// HTTP surface by the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No `.tex` source in the request.
    NoMainFile,
    /// The toolchain exited above 2 or produced no PDF.
    Toolchain,
    /// A PDF file exists but lacks the `%PDF` magic bytes.
    InvalidPdf,
    /// Unexpected error inside the pipeline or a worker.
    Internal,
}

impl FailureKind {
    /// Stable error code string used on the wire.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NoMainFile => "NO_MAIN_FILE",
            Self::Toolchain => "TOOLCHAIN_FAILURE",
            Self::InvalidPdf => "INVALID_PDF_FORMAT",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Outcome of one compile request.
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Request id minted when the worker picked the job up.
    pub request_id: String,
    /// Whether a PDF was produced (or served from cache).
    pub success: bool,
    /// The PDF bytes; empty on failure.
    pub pdf_data: Vec<u8>,
    /// Lowercase-hex SHA-256 of the PDF; empty on failure.
    pub pdf_sha256: String,
    /// SyncTeX sibling, when the engine produced one.
    pub synctex_data: Option<Vec<u8>>,
    /// Failure classification; `None` on success.
    pub failure: Option<FailureKind>,
    /// Human-readable failure message; empty on success.
    pub error_message: String,
    /// Tail of the toolchain's stdout.
    pub stdout: String,
    /// Tail of the toolchain's stderr.
    pub stderr: String,
    /// Last lines of the engine log.
    pub log_tail: String,
    /// Milliseconds the job waited in the admission queue.
    pub queue_ms: u64,
    /// Milliseconds spent compiling, measured from job pickup.
    pub duration_ms: u64,
    /// Whether this result came straight from the cache.
    pub cache_hit: bool,
}

impl CompileResult {
    /// A successful result with empty tails.
    #[must_use]
    pub fn success(
        request_id: impl Into<String>,
        pdf_data: Vec<u8>,
        pdf_sha256: impl Into<String>,
        queue_ms: u64,
        duration_ms: u64,
        cache_hit: bool,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            pdf_data,
            pdf_sha256: pdf_sha256.into(),
            synctex_data: None,
            failure: None,
            error_message: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            log_tail: String::new(),
            queue_ms,
            duration_ms,
            cache_hit,
        }
    }

    /// A failed result with empty tails.
    #[must_use]
    pub fn failure(
        request_id: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
        queue_ms: u64,
        duration_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            pdf_data: Vec::new(),
            pdf_sha256: String::new(),
            synctex_data: None,
            failure: Some(kind),
            error_message: message.into(),
            stdout: String::new(),
            stderr: String::new(),
            log_tail: String::new(),
            queue_ms,
            duration_ms,
            cache_hit: false,
        }
    }
}

/// Shared dependencies of every compile session.
pub struct CompileContext {
    /// The compilation cache, with its project locks.
    pub cache: Arc<CompilationCache>,
    /// The external toolchain.
    pub driver: Arc<dyn ToolchainDriver>,
    /// Optional per-request history records.
    pub history: Option<Arc<HistoryRecorder>>,
    /// Child-process limit for requests without a project id.
    pub stateless_timeout: Option<Duration>,
    /// Child-process limit for project builds; `None` lets the multi-pass
    /// pipeline run to completion.
    pub project_timeout: Option<Duration>,
}

impl CompileContext {
    /// Context with the default timeout policy.
    #[must_use]
    pub fn new(cache: Arc<CompilationCache>, driver: Arc<dyn ToolchainDriver>) -> Self {
        Self {
            cache,
            driver,
            history: None,
            stateless_timeout: Some(Duration::from_secs(30)),
            project_timeout: None,
        }
    }
}

/// Milliseconds elapsed since `start`, saturating.
#[must_use]
pub fn millis_since(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Milliseconds between two instants, saturating.
#[must_use]
pub fn millis_between(earlier: Instant, later: Instant) -> u64 {
    u64::try_from(later.saturating_duration_since(earlier).as_millis()).unwrap_or(u64::MAX)
}

/// The workspace a compile runs in, and who owns it.
enum Workspace {
    /// Created for this request; removed via [`Workspace::release`] unless
    /// handed to the cache. The drop impl of [`TempDir`] is a safety net
    /// for paths that never reach an explicit release.
    Fresh(TempDir),
    /// Reused from the cache, which keeps owning it on every path.
    CacheOwned(PathBuf),
}

impl Workspace {
    fn path(&self) -> &std::path::Path {
        match self {
            Self::Fresh(dir) => dir.path(),
            Self::CacheOwned(dir) => dir.as_path(),
        }
    }

    fn is_incremental(&self) -> bool {
        matches!(self, Self::CacheOwned(_))
    }

    /// Transfer ownership of the directory to the caller.
    fn into_cache_owned(self) -> PathBuf {
        match self {
            Self::Fresh(dir) => dir.keep(),
            Self::CacheOwned(dir) => dir,
        }
    }

    /// Remove a fresh workspace on the blocking pool; cache-owned
    /// directories are left alone - the cache entry still references them.
    async fn release(self) {
        if let Self::Fresh(dir) = self {
            let _ = tokio::task::spawn_blocking(move || drop(dir)).await;
        }
    }
}

/// Run one compile request to completion.
pub async fn compile(
    ctx: &CompileContext,
    files: Vec<FileEntry>,
    project_id: Option<String>,
    enqueued_at: Instant,
) -> CompileResult {
    let request_id = Uuid::new_v4().to_string();
    let received_at = Instant::now();
    let queue_ms = millis_between(enqueued_at, received_at);
    let project_id = project_id.unwrap_or_default();

    info!(
        request_id = %request_id,
        project_id = %project_id,
        files = files.len(),
        queue_ms,
        "compile request received"
    );

    let result = run_session(ctx, &request_id, &files, &project_id, received_at, queue_ms).await;

    if let Some(history) = &ctx.history {
        history.record(&result);
    }

    result
}

async fn run_session(
    ctx: &CompileContext,
    request_id: &str,
    files: &[FileEntry],
    project_id: &str,
    received_at: Instant,
    queue_ms: u64,
) -> CompileResult {
    let Some((main, has_docclass)) = fileset::find_main_file(files) else {
        warn!(request_id = %request_id, "no LaTeX source file in request");
        return CompileResult::failure(
            request_id,
            FailureKind::NoMainFile,
            "No LaTeX source (.tex) file found in request",
            queue_ms,
            millis_since(received_at),
        );
    };
    let main_rel = PathBuf::from(&main.path);
    let main_content = main.content.clone();

    if has_docclass {
        debug!(request_id = %request_id, main = %main.path, "main file detected by \\documentclass");
    } else {
        warn!(
            request_id = %request_id,
            main = %main.path,
            "no \\documentclass found; using first .tex file"
        );
    }

    let classification = classifier::classify(&main_content, files);
    log_classification(request_id, &classification);

    // All cache traffic for this request goes through the session; the
    // project lock it holds is released when the session drops, on every
    // path out of this function.
    let session = CacheSession::acquire(Arc::clone(&ctx.cache), project_id, request_id).await;

    if let Some(hit) = session
        .try_serve_cached(files, request_id, queue_ms, received_at)
        .await
    {
        return hit;
    }

    // Workspace materialization is plain filesystem work; it runs on the
    // blocking pool so large projects never stall the runtime threads.
    let (workspace_handle, changes) = match session.prepare_incremental_workspace(files).await {
        Some(incremental) => {
            info!(
                request_id = %request_id,
                dir = %incremental.workspace_dir.display(),
                added = incremental.changes.added.len(),
                modified = incremental.changes.modified.len(),
                deleted = incremental.changes.deleted.len(),
                "reusing cached workspace incrementally"
            );
            let IncrementalWorkspace {
                workspace_dir,
                changes,
            } = incremental;
            let applied = tokio::task::spawn_blocking(move || {
                let result = workspace::apply_changes(&workspace_dir, &changes);
                (workspace_dir, changes, result)
            })
            .await;
            match applied {
                Ok((workspace_dir, changes, Ok(()))) => {
                    (Workspace::CacheOwned(workspace_dir), Some(changes))
                },
                Ok((_, _, Err(err))) => {
                    return CompileResult::failure(
                        request_id,
                        FailureKind::Internal,
                        format!("Failed to update files: {err}"),
                        queue_ms,
                        millis_since(received_at),
                    );
                },
                Err(_) => {
                    return CompileResult::failure(
                        request_id,
                        FailureKind::Internal,
                        "Failed to update files: workspace task aborted",
                        queue_ms,
                        millis_since(received_at),
                    );
                },
            }
        },
        None => {
            let files_to_write = files.to_vec();
            let created = tokio::task::spawn_blocking(move || -> std::io::Result<TempDir> {
                let tempdir = tempfile::Builder::new().prefix("latex-").tempdir()?;
                workspace::write_file_set(tempdir.path(), &files_to_write)?;
                Ok(tempdir)
            })
            .await;
            match created {
                Ok(Ok(tempdir)) => {
                    debug!(
                        request_id = %request_id,
                        dir = %tempdir.path().display(),
                        "created fresh workspace"
                    );
                    (Workspace::Fresh(tempdir), None)
                },
                Ok(Err(err)) => {
                    return CompileResult::failure(
                        request_id,
                        FailureKind::Internal,
                        format!("Failed to write files: {err}"),
                        queue_ms,
                        millis_since(received_at),
                    );
                },
                Err(_) => {
                    return CompileResult::failure(
                        request_id,
                        FailureKind::Internal,
                        "Failed to write files: workspace task aborted",
                        queue_ms,
                        millis_since(received_at),
                    );
                },
            }
        },
    };

    let tex_path = workspace_handle.path().join(&main_rel);
    let pdf_path = tex_path.with_extension("pdf");
    let log_path = tex_path.with_extension("log");

    {
        let request_id = request_id.to_string();
        let pdf_path = pdf_path.clone();
        let log_path = log_path.clone();
        let _ = tokio::task::spawn_blocking(move || {
            remove_stale_output(&request_id, &pdf_path);
            remove_stale_output(&request_id, &log_path);
        })
        .await;
    }

    let mut plan = strategy::select(&main_content, files, &classification);
    if let Some(changes) = &changes {
        plan.refine_for_incremental(changes);
    }
    info!(
        request_id = %request_id,
        bibliography = %plan.bibliography_tool,
        multipass = plan.needs_multiple_passes,
        incremental = workspace_handle.is_incremental(),
        "compilation strategy selected"
    );

    let timeout = if project_id.is_empty() {
        ctx.stateless_timeout
    } else {
        ctx.project_timeout
    };

    let request = ToolchainRequest {
        workspace: workspace_handle.path().to_path_buf(),
        main_file: main_rel,
        engine: classification.engine,
        shell_escape: plan.shell_escape,
        python_tex: plan.python_tex,
        synctex: true,
        bibliography: plan.bibliography_tool,
        multiple_passes: plan.needs_multiple_passes,
        timeout,
    };

    let output = match ctx.driver.run(&request).await {
        Ok(output) => output,
        Err(err) => {
            workspace_handle.release().await;
            return CompileResult::failure(
                request_id,
                FailureKind::Toolchain,
                format!("Failed to run LaTeX toolchain: {err}"),
                queue_ms,
                millis_since(received_at),
            );
        },
    };

    finalize(
        &session,
        request_id,
        files,
        workspace_handle,
        &output,
        classification.engine.command(),
        &tex_path,
        &pdf_path,
        &log_path,
        queue_ms,
        received_at,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn finalize(
    session: &CacheSession,
    request_id: &str,
    files: &[FileEntry],
    workspace_handle: Workspace,
    output: &ToolchainOutput,
    engine_tag: &str,
    tex_path: &std::path::Path,
    pdf_path: &std::path::Path,
    log_path: &std::path::Path,
    queue_ms: u64,
    received_at: Instant,
) -> CompileResult {
    let duration_ms = millis_since(received_at);
    info!(
        request_id = %request_id,
        exit_code = output.exit_code,
        duration_ms,
        "toolchain finished"
    );

    // Pull the PDF, log tail and SyncTeX sibling off disk in one blocking
    // pass.
    let collected = {
        let pdf_path = pdf_path.to_path_buf();
        let log_path = log_path.to_path_buf();
        let synctex_path = tex_path.with_extension("synctex.gz");
        tokio::task::spawn_blocking(move || {
            let log_tail = read_log_tail(&log_path);
            let pdf = std::fs::read(&pdf_path);
            let synctex = std::fs::read(&synctex_path).ok();
            (pdf, log_tail, synctex)
        })
        .await
    };
    let (pdf_read, log_tail, synctex_data) = match collected {
        Ok(collected) => collected,
        Err(_) => {
            workspace_handle.release().await;
            return CompileResult::failure(
                request_id,
                FailureKind::Internal,
                "Failed to read toolchain outputs",
                queue_ms,
                duration_ms,
            );
        },
    };

    let Ok(pdf_data) = pdf_read else {
        let message = if output.timed_out {
            "LaTeX toolchain timed out before producing a PDF".to_string()
        } else {
            "PDF file not generated".to_string()
        };
        workspace_handle.release().await;
        return failure_with_tails(
            request_id,
            FailureKind::Toolchain,
            message,
            output,
            log_tail,
            queue_ms,
            duration_ms,
        );
    };

    if pdf_data.len() < 4 || &pdf_data[..4] != b"%PDF" {
        workspace_handle.release().await;
        return failure_with_tails(
            request_id,
            FailureKind::InvalidPdf,
            "Invalid PDF format",
            output,
            log_tail,
            queue_ms,
            duration_ms,
        );
    }

    if exit_indicates_failure(output.exit_code) {
        warn!(
            request_id = %request_id,
            exit_code = output.exit_code,
            "toolchain produced a PDF but exited above the warning range"
        );
        workspace_handle.release().await;
        return failure_with_tails(
            request_id,
            FailureKind::Toolchain,
            format!("LaTeX toolchain exited with code {}", output.exit_code),
            output,
            log_tail,
            queue_ms,
            duration_ms,
        );
    }

    if output.exit_code == 2 {
        info!(request_id = %request_id, "toolchain completed with warnings (exit code 2)");
    }

    let pdf_sha256 = hex::encode(Sha256::digest(&pdf_data));

    if let Some(synctex) = &synctex_data {
        debug!(request_id = %request_id, bytes = synctex.len(), "SyncTeX file loaded");
    }

    // Workspace ownership: with a project id, the directory transfers to
    // the cache entry; without one, it is removed here.
    if session.has_project() {
        let dir = workspace_handle.into_cache_owned();
        session
            .store(files, Some(dir), &pdf_data, &pdf_sha256, engine_tag)
            .await;
    } else {
        workspace_handle.release().await;
    }

    info!(request_id = %request_id, pdf_bytes = pdf_data.len(), "compilation successful");

    let mut result = CompileResult::success(
        request_id,
        pdf_data,
        pdf_sha256,
        queue_ms,
        duration_ms,
        false,
    );
    result.synctex_data = synctex_data;
    result.log_tail = log_tail;
    result
}

fn failure_with_tails(
    request_id: &str,
    kind: FailureKind,
    message: impl Into<String>,
    output: &ToolchainOutput,
    log_tail: String,
    queue_ms: u64,
    duration_ms: u64,
) -> CompileResult {
    let mut result =
        CompileResult::failure(request_id, kind, message, queue_ms, duration_ms);
    result.stdout = truncate_tail(&output.stdout, MAX_LOG_CHARS);
    result.stderr = truncate_tail(&output.stderr, MAX_LOG_CHARS);
    result.log_tail = log_tail;
    result
}

fn read_log_tail(log_path: &std::path::Path) -> String {
    match std::fs::read_to_string(log_path) {
        Ok(content) => tail_lines(&truncate_tail(&content, MAX_LOG_CHARS), LOG_TAIL_LINES),
        Err(_) => String::new(),
    }
}

fn remove_stale_output(request_id: &str, path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(request_id = %request_id, path = %path.display(), "removed stale output"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
        Err(err) => warn!(
            request_id = %request_id,
            path = %path.display(),
            error = %err,
            "failed to remove stale output"
        ),
    }
}

fn log_classification(request_id: &str, classification: &EngineClassification) {
    match &classification.engine_trigger {
        Some(trigger) => info!(
            request_id = %request_id,
            engine = %classification.engine,
            trigger = %trigger,
            "selected engine"
        ),
        None => debug!(
            request_id = %request_id,
            engine = %classification.engine,
            "selected default engine"
        ),
    }
    if classification.requires_shell_escape {
        info!(request_id = %request_id, "shell escape enabled");
    }
    if classification.requires_python_tex {
        info!(request_id = %request_id, "PythonTeX helper will run between passes");
    }
    if classification.classic_required {
        debug!(
            request_id = %request_id,
            reasons = ?classification.classic_reasons,
            "project would require the classic toolchain"
        );
    }
}
