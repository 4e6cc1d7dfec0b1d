//! texd - LaTeX compilation daemon.
//!
//! Accepts project file sets over HTTP, compiles them with the local TeX
//! toolchain through a bounded worker pool, and caches per-project
//! workspaces and PDFs for incremental recompiles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use texd_core::toolchain::LatexmkDriver;
use texd_daemon::admission::{AdmissionConfig, AdmissionQueue, DEFAULT_ENQUEUE_TIMEOUT};
use texd_daemon::cache::{CacheConfig, CompilationCache};
use texd_daemon::compile::CompileContext;
use texd_daemon::history::HistoryRecorder;
use texd_daemon::http::{self, AppState};

/// texd daemon - LaTeX compilation service
#[derive(Parser, Debug)]
#[command(name = "texd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, env = "TEXD_PORT", default_value_t = 3001)]
    port: u16,

    /// Number of concurrent compile workers
    #[arg(long, env = "TEXD_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Admission queue capacity (default: 2x workers)
    #[arg(long, env = "TEXD_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Maximum number of cached projects
    #[arg(long, env = "TEXD_CACHE_MAX_PROJECTS", default_value_t = 15)]
    cache_max_projects: usize,

    /// Minutes of inactivity before a cached project expires
    #[arg(long, env = "TEXD_CACHE_EXPIRY_MINUTES", default_value_t = 30)]
    cache_expiry_minutes: u64,

    /// Minutes between expiry sweeps
    #[arg(long, env = "TEXD_CACHE_SWEEP_MINUTES", default_value_t = 60)]
    cache_sweep_minutes: u64,

    /// latexmk binary override
    #[arg(long, env = "TEXD_LATEXMK_BINARY", default_value = "latexmk")]
    latexmk_binary: String,

    /// Toolchain timeout for project builds, in seconds (0 = unlimited)
    #[arg(long, env = "TEXD_TOOLCHAIN_TIMEOUT_SECONDS", default_value_t = 0)]
    toolchain_timeout_seconds: u64,

    /// Toolchain timeout for requests without a project id, in seconds
    #[arg(long, env = "TEXD_STATELESS_TIMEOUT_SECONDS", default_value_t = 30)]
    stateless_timeout_seconds: u64,

    /// Directory for per-request history records (disabled when unset)
    #[arg(long, env = "TEXD_HISTORY_DIR")]
    history_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TEXD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cache = Arc::new(CompilationCache::new(CacheConfig {
        max_entries: args.cache_max_projects,
        expiry: Duration::from_secs(args.cache_expiry_minutes * 60),
        sweep_interval: Duration::from_secs(args.cache_sweep_minutes * 60),
    }));
    let sweeper = cache.spawn_sweeper();

    let history = match &args.history_dir {
        Some(dir) => Some(Arc::new(
            HistoryRecorder::new(dir).context("failed to create history directory")?,
        )),
        None => None,
    };

    let ctx = Arc::new(CompileContext {
        cache: Arc::clone(&cache),
        driver: Arc::new(LatexmkDriver::with_binary(args.latexmk_binary.clone())),
        history,
        stateless_timeout: nonzero_secs(args.stateless_timeout_seconds),
        project_timeout: nonzero_secs(args.toolchain_timeout_seconds),
    });

    let admission = AdmissionConfig {
        workers: args.workers,
        queue_capacity: args.queue_capacity.unwrap_or(args.workers * 2),
        enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
    };
    let (queue, _workers) = AdmissionQueue::start(&admission, ctx);

    let state = Arc::new(AppState {
        queue,
        cache: Arc::clone(&cache),
    });
    let app = http::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        port = args.port,
        workers = admission.workers,
        queue_capacity = admission.queue_capacity,
        cache_max_projects = args.cache_max_projects,
        "texd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    info!("texd exited");
    Ok(())
}

const fn nonzero_secs(seconds: u64) -> Option<Duration> {
    if seconds == 0 {
        None
    } else {
        Some(Duration::from_secs(seconds))
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}
