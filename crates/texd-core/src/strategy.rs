//! Compilation strategy selector.
//!
//! Decides the pass plan for a request: whether a bibliography tool must
//! run (and which one), whether multiple engine passes are needed for
//! cross-references, and whether shell escape is enabled. When a file diff
//! is available the plan is refined so unchanged projects do not pay for
//! the full bibliography pipeline.

use crate::classifier::EngineClassification;
use crate::diff::FileChanges;
use crate::fileset::{FileEntry, FileKind};

/// The bibliography processor to run between engine passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BibliographyTool {
    /// No bibliography processing.
    #[default]
    None,
    /// Classic `bibtex`.
    Bibtex,
    /// `biber`, for biblatex-backed projects.
    Biber,
}

impl std::fmt::Display for BibliographyTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Bibtex => "bibtex",
            Self::Biber => "biber",
        })
    }
}

/// The selected pass plan for one compile.
#[derive(Debug, Clone, Default)]
pub struct CompileStrategy {
    /// Whether a bibliography tool must run.
    pub needs_bibliography: bool,
    /// Whether extra engine passes are needed for labels and tables of
    /// contents.
    pub needs_multiple_passes: bool,
    /// Which bibliography tool to run when `needs_bibliography`.
    pub bibliography_tool: BibliographyTool,
    /// Whether the engine runs with `-shell-escape`.
    pub shell_escape: bool,
    /// Whether the PythonTeX helper runs between passes.
    pub python_tex: bool,
}

const BIBLIOGRAPHY_MARKERS: &[&str] = &[
    "\\bibliography{",
    "\\addbibresource{",
    "\\cite{",
    "\\citep{",
    "\\citet{",
    "\\nocite{",
];

const MULTIPASS_MARKERS: &[&str] = &[
    "\\ref{",
    "\\pageref{",
    "\\eqref{",
    "\\label{",
    "\\tableofcontents",
    "\\listoffigures",
    "\\listoftables",
];

const BIBER_MARKERS: &[&str] = &[
    "\\addbibresource",
    "\\printbibliography",
    "backend=biber",
];

/// Select the pass plan from the main source, the file set, and the
/// classifier's verdict.
#[must_use]
pub fn select(
    main_content: &str,
    files: &[FileEntry],
    classification: &EngineClassification,
) -> CompileStrategy {
    let has_bib_file = files.iter().any(|file| file.kind() == FileKind::Bib);

    let needs_bibliography =
        has_bib_file || BIBLIOGRAPHY_MARKERS.iter().any(|m| main_content.contains(m));
    let needs_multiple_passes = MULTIPASS_MARKERS.iter().any(|m| main_content.contains(m));

    let bibliography_tool = if needs_bibliography {
        detect_bibliography_tool(main_content)
    } else {
        BibliographyTool::None
    };

    CompileStrategy {
        needs_bibliography,
        needs_multiple_passes,
        bibliography_tool,
        shell_escape: classification.requires_shell_escape,
        python_tex: classification.requires_python_tex,
    }
}

/// Pick biber for biblatex-backed sources, bibtex otherwise.
fn detect_bibliography_tool(main_content: &str) -> BibliographyTool {
    if main_content.contains("backend=bibtex") {
        return BibliographyTool::Bibtex;
    }
    if main_content.contains("\\usepackage{biblatex}")
        || main_content.contains("{biblatex}")
        || BIBER_MARKERS.iter().any(|m| main_content.contains(m))
    {
        return BibliographyTool::Biber;
    }
    BibliographyTool::Bibtex
}

impl CompileStrategy {
    /// Refine the plan using the diff against the cached build.
    ///
    /// Unchanged and asset-only updates drop to a single pass; tex-only
    /// edits keep the bibliography pipeline alive only when one is
    /// configured; bib-only edits always rerun the bibliography pipeline
    /// in full.
    pub fn refine_for_incremental(&mut self, changes: &FileChanges) {
        let bibliography_configured =
            self.needs_bibliography || self.bibliography_tool != BibliographyTool::None;

        if !changes.has_bib_changes {
            if !changes.has_tex_changes {
                // Nothing changed, or only assets did; one pass re-embeds them.
                self.needs_bibliography = false;
                self.needs_multiple_passes = false;
            } else if !bibliography_configured {
                self.needs_bibliography = false;
            } else {
                // .tex changed with a bibliography configured: rerun the
                // bibliography tool so citation edits are reflected.
                self.needs_bibliography = true;
            }
        } else if !changes.has_tex_changes && !bibliography_configured {
            self.needs_bibliography = false;
        }
        // Bib changes with a configured bibliography stay on the full
        // pipeline. Skipping the first engine pass here is tempting but
        // unproven; see DESIGN.md.

        if !self.needs_bibliography {
            self.bibliography_tool = BibliographyTool::None;
        }
    }
}
