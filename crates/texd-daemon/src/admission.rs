//! Request admission and the worker pool.
//!
//! Compile jobs flow through a bounded FIFO. Admission is two-stage: a
//! full queue rejects immediately, an apparently free queue is given a
//! bounded wait to cover races. N workers drain the queue; each job
//! carries a single-shot reply channel and a worker always answers it,
//! converting panics into failure results instead of leaking the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{debug, error, info};
use uuid::Uuid;

use texd_core::fileset::FileEntry;

use crate::compile::{self, CompileContext, CompileResult, FailureKind, millis_since};

/// How long an enqueue may wait for a slot before giving up.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Number of concurrent compile workers.
    pub workers: usize,
    /// Queue capacity. Conventionally twice the worker count.
    pub queue_capacity: usize,
    /// Bounded wait applied when the queue looks free but a slot races away.
    pub enqueue_timeout: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 4,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }
}

/// A queued compile request.
#[derive(Debug)]
pub struct CompileJob {
    /// The request file set.
    pub files: Vec<FileEntry>,
    /// Optional project id for cache affinity.
    pub project_id: Option<String>,
    /// When the job entered the queue; queue latency is measured from here.
    pub enqueued_at: Instant,
    /// Single-shot reply channel back to the HTTP handler.
    pub reply: oneshot::Sender<CompileResult>,
}

/// Why a job was not admitted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The queue had no free slot at submission time.
    #[error("compile queue is full")]
    Full {
        /// Position a client would have held, for the error body.
        queue_position: usize,
    },

    /// A slot did not free up within the bounded wait.
    #[error("timed out waiting for a queue slot")]
    Timeout,

    /// The worker pool is gone; the daemon is shutting down.
    #[error("compile queue is closed")]
    Closed,
}

/// Handle for submitting jobs to the worker pool.
#[derive(Clone)]
pub struct AdmissionQueue {
    sender: mpsc::Sender<CompileJob>,
    enqueue_timeout: Duration,
}

impl AdmissionQueue {
    /// Create the queue and spawn its workers.
    pub fn start(
        config: &AdmissionConfig,
        ctx: Arc<CompileContext>,
    ) -> (Self, Vec<tokio::task::JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let handles = (0..config.workers)
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(worker_loop(worker_id, receiver, ctx))
            })
            .collect();

        (
            Self {
                sender,
                enqueue_timeout: config.enqueue_timeout,
            },
            handles,
        )
    }

    /// Jobs currently waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Total queue capacity.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    /// Submit a job for compilation.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::Full`] when no slot is free, [`EnqueueError::Timeout`]
    /// when a slot does not open within the bounded wait, and
    /// [`EnqueueError::Closed`] during shutdown.
    pub async fn submit(&self, job: CompileJob) -> Result<(), EnqueueError> {
        if self.sender.capacity() == 0 {
            return Err(EnqueueError::Full {
                queue_position: self.queue_len() + 1,
            });
        }

        match self.sender.send_timeout(job, self.enqueue_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(EnqueueError::Timeout),
            Err(SendTimeoutError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }
}

/// One worker: pull jobs until the queue closes, always answer the reply
/// channel.
async fn worker_loop(
    worker_id: usize,
    receiver: Arc<AsyncMutex<mpsc::Receiver<CompileJob>>>,
    ctx: Arc<CompileContext>,
) {
    info!(worker_id, "compile worker started");

    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            info!(worker_id, "compile worker stopped");
            break;
        };

        let CompileJob {
            files,
            project_id,
            enqueued_at,
            reply,
        } = job;

        // Run the pipeline in its own task so a panic is contained and
        // converted into a failure result instead of killing the worker.
        let task_ctx = Arc::clone(&ctx);
        let task = tokio::spawn(async move {
            compile::compile(&task_ctx, files, project_id, enqueued_at).await
        });

        let result = match task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                error!(worker_id, "compile task panicked");
                CompileResult::failure(
                    Uuid::new_v4().to_string(),
                    FailureKind::Internal,
                    "Internal server error: compile task panicked",
                    millis_since(enqueued_at),
                    0,
                )
            },
            Err(err) => {
                error!(worker_id, error = %err, "compile task aborted");
                CompileResult::failure(
                    Uuid::new_v4().to_string(),
                    FailureKind::Internal,
                    format!("Internal server error: {err}"),
                    millis_since(enqueued_at),
                    0,
                )
            },
        };

        if reply.send(result).is_err() {
            debug!(worker_id, "caller went away; dropping compile result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use async_trait::async_trait;

    use texd_core::toolchain::{ToolchainDriver, ToolchainOutput, ToolchainRequest};

    use crate::cache::{CacheConfig, CompilationCache};

    /// Driver that writes a tiny valid PDF next to the main file.
    #[derive(Debug)]
    struct PdfWritingDriver;

    #[async_trait]
    impl ToolchainDriver for PdfWritingDriver {
        async fn run(&self, request: &ToolchainRequest) -> io::Result<ToolchainOutput> {
            let pdf = request
                .workspace
                .join(&request.main_file)
                .with_extension("pdf");
            std::fs::write(&pdf, b"%PDF-1.5 test output")?;
            Ok(ToolchainOutput {
                exit_code: 0,
                stdout: "ok".to_string(),
                stderr: String::new(),
                timed_out: false,
            })
        }
    }

    /// Driver that panics mid-compile.
    #[derive(Debug)]
    struct PanickingDriver;

    #[async_trait]
    impl ToolchainDriver for PanickingDriver {
        async fn run(&self, _request: &ToolchainRequest) -> io::Result<ToolchainOutput> {
            panic!("simulated driver crash");
        }
    }

    fn context(driver: Arc<dyn ToolchainDriver>) -> Arc<CompileContext> {
        Arc::new(CompileContext::new(
            Arc::new(CompilationCache::new(CacheConfig::default())),
            driver,
        ))
    }

    fn job(reply: oneshot::Sender<CompileResult>) -> CompileJob {
        CompileJob {
            files: vec![FileEntry::text(
                "main.tex",
                "\\documentclass{article}\\begin{document}A\\end{document}",
            )],
            project_id: None,
            enqueued_at: Instant::now(),
            reply,
        }
    }

    #[tokio::test]
    async fn worker_delivers_result_on_reply_channel() {
        let ctx = context(Arc::new(PdfWritingDriver));
        let (queue, _workers) = AdmissionQueue::start(&AdmissionConfig::default(), ctx);

        let (tx, rx) = oneshot::channel();
        queue.submit(job(tx)).await.unwrap();

        let result = rx.await.expect("worker answers the reply channel");
        assert!(result.success);
        assert!(result.pdf_data.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn full_queue_rejects_immediately() {
        // No workers: jobs stay queued and the capacity bound is observable.
        let ctx = context(Arc::new(PdfWritingDriver));
        let config = AdmissionConfig {
            workers: 0,
            queue_capacity: 1,
            enqueue_timeout: Duration::from_millis(50),
        };
        let (queue, _workers) = AdmissionQueue::start(&config, ctx);

        let (tx1, _rx1) = oneshot::channel();
        queue.submit(job(tx1)).await.unwrap();
        assert_eq!(queue.queue_len(), 1);

        let (tx2, _rx2) = oneshot::channel();
        let err = queue.submit(job(tx2)).await.unwrap_err();
        assert_eq!(err, EnqueueError::Full { queue_position: 2 });
    }

    #[tokio::test]
    async fn panicking_compile_becomes_internal_failure() {
        let ctx = context(Arc::new(PanickingDriver));
        let (queue, _workers) = AdmissionQueue::start(
            &AdmissionConfig {
                workers: 1,
                ..AdmissionConfig::default()
            },
            ctx,
        );

        let (tx, rx) = oneshot::channel();
        queue.submit(job(tx)).await.unwrap();

        let result = rx.await.expect("panic converted to a result, not a leak");
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Internal));
    }

    #[tokio::test]
    async fn worker_survives_a_panicking_job() {
        let ctx = context(Arc::new(PanickingDriver));
        let (queue, _workers) = AdmissionQueue::start(
            &AdmissionConfig {
                workers: 1,
                ..AdmissionConfig::default()
            },
            ctx,
        );

        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            queue.submit(job(tx)).await.unwrap();
            let result = rx.await.unwrap();
            assert_eq!(result.failure, Some(FailureKind::Internal));
        }
    }
}
