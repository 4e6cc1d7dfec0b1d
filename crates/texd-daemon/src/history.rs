//! Per-request history records.
//!
//! Optionally writes one JSON document per compile request for offline
//! inspection. Strictly out of the hot path: failures are logged and never
//! surface to the caller.

use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::compile::CompileResult;

/// Writes compile metadata to `<dir>/<request_id>.json`.
#[derive(Debug)]
pub struct HistoryRecorder {
    dir: PathBuf,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord<'a> {
    request_id: &'a str,
    completed_at: String,
    status: &'static str,
    queue_ms: u64,
    duration_ms: u64,
    cache_hit: bool,
    #[serde(skip_serializing_if = "is_zero")]
    pdf_size: usize,
    #[serde(skip_serializing_if = "str::is_empty")]
    sha256: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    error: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    log_tail: &'a str,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl HistoryRecorder {
    /// Create the recorder, ensuring the target directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persist one record; errors are logged and swallowed.
    pub fn record(&self, result: &CompileResult) {
        let record = HistoryRecord {
            request_id: &result.request_id,
            completed_at: chrono::Utc::now().to_rfc3339(),
            status: if result.success { "success" } else { "error" },
            queue_ms: result.queue_ms,
            duration_ms: result.duration_ms,
            cache_hit: result.cache_hit,
            pdf_size: result.pdf_data.len(),
            sha256: &result.pdf_sha256,
            error: &result.error_message,
            log_tail: &result.log_tail,
        };

        let path = self.dir.join(format!("{}.json", result.request_id));
        match serde_json::to_vec_pretty(&record) {
            Ok(data) => {
                if let Err(err) = std::fs::write(&path, data) {
                    warn!(path = %path.display(), error = %err, "failed to persist history record");
                }
            },
            Err(err) => warn!(error = %err, "failed to serialize history record"),
        }
    }
}
