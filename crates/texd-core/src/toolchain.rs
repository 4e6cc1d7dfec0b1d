//! External toolchain driver.
//!
//! Abstracts the child-process side of a compile: the orchestrator hands a
//! workspace, a main file and a pass plan to a [`ToolchainDriver`] and gets
//! captured output back. The production driver shells out to `latexmk`,
//! which owns pass management and bibliography tool sequencing; tests swap
//! in mock drivers at this seam.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::classifier::LatexEngine;
use crate::strategy::BibliographyTool;

/// Maximum characters kept from stdout/stderr/log tails in results.
pub const MAX_LOG_CHARS: usize = 5000;

/// Number of engine-log lines kept in result tails.
pub const LOG_TAIL_LINES: usize = 80;

/// Bound on raw captured output per stream, to keep chatty engines from
/// ballooning memory. Only the tail survives.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Everything a driver needs to run the toolchain once.
#[derive(Debug, Clone)]
pub struct ToolchainRequest {
    /// Workspace root holding the project files.
    pub workspace: PathBuf,
    /// Main file path, relative to the workspace.
    pub main_file: PathBuf,
    /// Engine to run.
    pub engine: LatexEngine,
    /// Whether `-shell-escape` is enabled.
    pub shell_escape: bool,
    /// Whether the PythonTeX helper runs between passes.
    pub python_tex: bool,
    /// Whether a SyncTeX file is requested alongside the PDF.
    pub synctex: bool,
    /// Bibliography tool the plan selected. `latexmk` sequences the tool
    /// itself; the field is carried for drivers that run passes directly.
    pub bibliography: BibliographyTool,
    /// Whether the plan calls for multiple engine passes.
    pub multiple_passes: bool,
    /// Hard wall-clock limit for each child process, if any.
    pub timeout: Option<Duration>,
}

/// Captured result of a toolchain run.
#[derive(Debug, Clone, Default)]
pub struct ToolchainOutput {
    /// Exit code of the last process run (`-1` when killed by signal).
    pub exit_code: i32,
    /// Accumulated stdout across stages, tail-bounded.
    pub stdout: String,
    /// Accumulated stderr across stages, tail-bounded.
    pub stderr: String,
    /// Whether any stage was killed by the configured timeout.
    pub timed_out: bool,
}

/// Exit codes 0-2 with a valid PDF count as success; anything above is a
/// failure even when a PDF was produced. Code 1 can still leave a usable
/// PDF behind and code 2 is the engines' warnings-only exit.
#[must_use]
pub const fn exit_indicates_failure(exit_code: i32) -> bool {
    exit_code > 2 || exit_code < 0
}

/// Abstracted child-process invocation.
#[async_trait]
pub trait ToolchainDriver: Send + Sync {
    /// Run the toolchain to completion for one request.
    ///
    /// # Errors
    ///
    /// Returns an error only when the process could not be spawned or its
    /// output could not be collected; toolchain failures are reported via
    /// [`ToolchainOutput::exit_code`].
    async fn run(&self, request: &ToolchainRequest) -> io::Result<ToolchainOutput>;
}

/// Production driver: a single `latexmk` invocation per stage.
///
/// `latexmk -f -pdf` owns rerunning the engine until references settle and
/// invoking bibtex/biber when the sources call for them, so the driver
/// stays a thin wrapper. When PythonTeX is in play the sequence becomes
/// `latexmk -> pythontex -> latexmk`.
#[derive(Debug, Clone)]
pub struct LatexmkDriver {
    /// `latexmk` binary, overridable for tests and exotic installs.
    pub binary: String,
    /// `pythontex` helper binary.
    pub pythontex_binary: String,
}

impl Default for LatexmkDriver {
    fn default() -> Self {
        Self {
            binary: "latexmk".to_string(),
            pythontex_binary: "pythontex".to_string(),
        }
    }
}

impl LatexmkDriver {
    /// Create a driver with an overridden `latexmk` binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    async fn run_latexmk(
        &self,
        request: &ToolchainRequest,
        stage: &str,
        output: &mut ToolchainOutput,
    ) -> io::Result<()> {
        let main_dir = request
            .main_file
            .parent()
            .map_or_else(|| request.workspace.clone(), |p| request.workspace.join(p));
        let main_name = request
            .main_file
            .file_name()
            .map_or_else(|| request.main_file.clone().into_os_string(), Into::into);

        let args = build_latexmk_args(request);
        debug!(stage, binary = %self.binary, ?args, "running latexmk");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .arg(main_name)
            .current_dir(&main_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        run_stage(cmd, request.timeout, stage, output).await
    }

    async fn run_pythontex(
        &self,
        request: &ToolchainRequest,
        output: &mut ToolchainOutput,
    ) -> io::Result<()> {
        let main_name = request
            .main_file
            .file_name()
            .map_or_else(|| request.main_file.clone().into_os_string(), Into::into);

        let mut cmd = Command::new(&self.pythontex_binary);
        cmd.arg(main_name)
            .current_dir(&request.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        run_stage(cmd, request.timeout, "pythontex", output).await
    }
}

#[async_trait]
impl ToolchainDriver for LatexmkDriver {
    async fn run(&self, request: &ToolchainRequest) -> io::Result<ToolchainOutput> {
        let mut output = ToolchainOutput::default();

        info!(
            engine = %request.engine,
            bibliography = %request.bibliography,
            multiple_passes = request.multiple_passes,
            python_tex = request.python_tex,
            shell_escape = request.shell_escape,
            "delegating compilation to latexmk"
        );

        self.run_latexmk(request, "initial", &mut output).await?;

        if output.exit_code == 0 && !output.timed_out && request.python_tex {
            self.run_pythontex(request, &mut output).await?;
            if output.exit_code == 0 && !output.timed_out {
                self.run_latexmk(request, "post-pythontex", &mut output)
                    .await?;
            }
        }

        Ok(output)
    }
}

/// Engine options and latexmk flags for one invocation.
fn build_latexmk_args(request: &ToolchainRequest) -> Vec<String> {
    let mut engine_opts = vec![
        "-interaction=nonstopmode".to_string(),
        "-halt-on-error".to_string(),
        "-file-line-error".to_string(),
    ];
    if request.synctex {
        engine_opts.push("-synctex=1".to_string());
    }
    if request.shell_escape {
        engine_opts.push("-shell-escape".to_string());
    }

    let latex_command = format!(
        "{} {} %O %S",
        request.engine.command(),
        engine_opts.join(" ")
    );

    vec![
        "-silent".to_string(),
        "-f".to_string(),
        "-pdf".to_string(),
        format!("-pdflatex={latex_command}"),
    ]
}

/// Run one child process stage, folding its output into the accumulator.
async fn run_stage(
    mut cmd: Command,
    timeout: Option<Duration>,
    stage: &str,
    acc: &mut ToolchainOutput,
) -> io::Result<()> {
    let child = cmd.spawn()?;

    let collected = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // kill_on_drop reaped the child when the future was dropped.
                warn!(stage, ?limit, "toolchain stage timed out");
                acc.timed_out = true;
                acc.exit_code = -1;
                return Ok(());
            },
        },
        None => child.wait_with_output().await?,
    };

    append_bounded(&mut acc.stdout, &String::from_utf8_lossy(&collected.stdout));
    append_bounded(&mut acc.stderr, &String::from_utf8_lossy(&collected.stderr));
    acc.exit_code = collected.status.code().unwrap_or(-1);

    if acc.exit_code == 0 {
        debug!(stage, "toolchain stage completed");
    } else {
        warn!(stage, exit_code = acc.exit_code, "toolchain stage exited nonzero");
    }

    Ok(())
}

fn append_bounded(acc: &mut String, chunk: &str) {
    acc.push_str(chunk);
    if acc.len() > MAX_CAPTURE_BYTES {
        *acc = truncate_tail(acc, MAX_CAPTURE_BYTES);
    }
}

/// Keep the last `max_chars` characters of `text`.
#[must_use]
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    // Step forward to the next char boundary so the slice stays valid UTF-8.
    let mut start = text.len() - max_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Keep the last `max_lines` lines of `text`.
#[must_use]
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    lines[lines.len() - max_lines..].join("\n")
}
