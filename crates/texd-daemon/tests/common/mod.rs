//! Shared fixtures for the pipeline tests.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use texd_core::toolchain::{ToolchainDriver, ToolchainOutput, ToolchainRequest};

/// A stand-in for `latexmk` that records every invocation and fabricates a
/// PDF deterministically derived from the main file's content, so
/// identical inputs produce identical bytes.
#[derive(Debug)]
pub struct RecordingDriver {
    requests: Mutex<Vec<ToolchainRequest>>,
    exit_code: i32,
    output_mode: OutputMode,
}

#[derive(Debug, Clone, Copy)]
enum OutputMode {
    Pdf,
    Garbage,
    Nothing,
}

impl RecordingDriver {
    /// Driver that always succeeds with a valid PDF.
    pub fn success() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            exit_code: 0,
            output_mode: OutputMode::Pdf,
        }
    }

    /// Driver that writes a valid PDF but exits with the given code.
    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::success()
        }
    }

    /// Driver that produces a file without the `%PDF` magic.
    pub fn invalid_pdf() -> Self {
        Self {
            output_mode: OutputMode::Garbage,
            ..Self::success()
        }
    }

    /// Driver that produces no output file at all.
    pub fn no_pdf() -> Self {
        Self {
            exit_code: 1,
            output_mode: OutputMode::Nothing,
            ..Self::success()
        }
    }

    /// Number of toolchain invocations so far.
    pub fn invocations(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Snapshot of every request seen.
    pub fn requests(&self) -> Vec<ToolchainRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolchainDriver for RecordingDriver {
    async fn run(&self, request: &ToolchainRequest) -> io::Result<ToolchainOutput> {
        self.requests.lock().unwrap().push(request.clone());

        let main_path = request.workspace.join(&request.main_file);
        let pdf_path = main_path.with_extension("pdf");

        match self.output_mode {
            OutputMode::Pdf => {
                let main_content = std::fs::read_to_string(&main_path)?;
                let digest = hex::encode(Sha256::digest(main_content.as_bytes()));
                std::fs::write(&pdf_path, format!("%PDF-1.5\n% fabricated {digest}\n"))?;
            },
            OutputMode::Garbage => {
                std::fs::write(&pdf_path, b"this is not a pdf")?;
            },
            OutputMode::Nothing => {},
        }

        Ok(ToolchainOutput {
            exit_code: self.exit_code,
            stdout: "Latexmk: All targets are up-to-date\n".to_string(),
            stderr: String::new(),
            timed_out: false,
        })
    }
}
