//! Engine classifier.
//!
//! A pure scan over the request sources that decides which LaTeX engine to
//! run, whether shell escape must be enabled, whether the PythonTeX helper
//! is needed, and whether the project would have required the classic
//! TeX Live toolchain (kept as routing hints; no fallback chaining happens
//! here).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::fileset::{FileEntry, FileKind};

/// The LaTeX engine to invoke.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatexEngine {
    /// The default engine.
    #[default]
    PdfLatex,
    /// Selected for fontspec/CJK/unicode-math projects.
    XeLatex,
    /// Selected for projects using Lua callouts or `lua*` packages.
    LuaLatex,
}

impl LatexEngine {
    /// The executable name for this engine.
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::PdfLatex => "pdflatex",
            Self::XeLatex => "xelatex",
            Self::LuaLatex => "lualatex",
        }
    }
}

impl std::fmt::Display for LatexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.command())
    }
}

/// Routing hints produced by a classification pass.
#[derive(Debug, Clone, Default)]
pub struct EngineClassification {
    /// Engine to run.
    pub engine: LatexEngine,
    /// The source construct that selected a non-default engine, if any.
    pub engine_trigger: Option<String>,
    /// Whether the toolchain needs `-shell-escape`.
    pub requires_shell_escape: bool,
    /// Whether the PythonTeX helper must run between passes.
    pub requires_python_tex: bool,
    /// Whether the project would need the classic TeX Live toolchain.
    pub classic_required: bool,
    /// Human-readable reasons behind `classic_required`.
    pub classic_reasons: Vec<String>,
}

const LUA_TRIGGERS: &[&str] = &[
    "\\directlua",
    "\\usepackage{luacode",
    "\\usepackage{luacolor",
    "\\usepackage{luatex",
    "\\usepackage{luaotfload",
    "\\usepackage{luapackageloader",
    "\\luaexec",
    "\\luadirect",
    "\\newluafunction",
    "\\begin{luacode",
];

const XE_TRIGGERS: &[&str] = &[
    "\\setmainfont",
    "\\setsansfont",
    "\\setmonofont",
    "\\newfontfamily",
    "\\usepackage{xecjk",
    "\\setcjkmainfont",
    "\\setcjkfamilyfont",
    "\\usepackage{polyglossia",
    "\\usepackage{mathspec",
    "\\usepackage{unicode-math",
    "\\xeprintrule",
    "\\xetex",
    "\\defaultfontfeatures",
];

const SHELL_ESCAPE_SIGNALS: &[&str] = &[
    "\\write18",
    "%!tex enableshellescape",
    "% !tex enableshellescape",
];

const SHELL_ESCAPE_PACKAGES: &[&str] =
    &["minted", "pythontex", "pygmentex", "gnuplottex", "shellesc"];

const PYTHON_TEX_ENVIRONMENTS: &[&str] = &["\\begin{python", "\\begin{pycode", "\\begin{pylab"];

const UNSUPPORTED_PACKAGES: &[&str] = &["auto-pst-pdf", "pstool", "pstricks", "tex4ht"];

const BIBER_HINTS: &[&str] = &[
    "backend=biber",
    "%!bib program = biber",
    "% !bib program = biber",
];

/// Classify a project from its main source plus every tex-like file.
///
/// The scan is case-insensitive; base64 entries and empty contents are
/// skipped.
#[must_use]
pub fn classify(main_content: &str, files: &[FileEntry]) -> EngineClassification {
    let corpus = build_corpus(main_content, files);
    let has_bib_file = files
        .iter()
        .any(|file| file.kind() == FileKind::Bib);

    let mut classification = EngineClassification::default();

    if let Some(trigger) = first_match(&corpus, LUA_TRIGGERS) {
        classification.engine = LatexEngine::LuaLatex;
        classification.engine_trigger = Some(trigger.to_string());
    } else if let Some(trigger) = detect_xe_trigger(&corpus) {
        classification.engine = LatexEngine::XeLatex;
        classification.engine_trigger = Some(trigger);
    }

    classification.requires_python_tex = uses_python_tex(&corpus);

    if let Some(reason) = detect_shell_escape(&corpus) {
        classification.requires_shell_escape = true;
        classification.classic_required = true;
        classification.classic_reasons.push(reason);
    } else if classification.requires_python_tex {
        // PythonTeX runs arbitrary code through \write18.
        classification.requires_shell_escape = true;
    }

    if let Some(directive) = detect_engine_directive(&corpus) {
        if directive_requires_classic(&directive) {
            classification.classic_required = true;
            classification
                .classic_reasons
                .push(format!("engine directive requests {directive}"));
        }
    }

    let unsupported: Vec<&str> = {
        let packages = extract_packages(&corpus);
        UNSUPPORTED_PACKAGES
            .iter()
            .copied()
            .filter(|pkg| packages.contains(*pkg))
            .collect()
    };
    if !unsupported.is_empty() {
        classification.classic_required = true;
        classification
            .classic_reasons
            .push(format!("uses unsupported packages: {}", unsupported.join(", ")));
    }

    if has_bib_file && BIBER_HINTS.iter().any(|hint| corpus.contains(hint)) {
        classification.classic_required = true;
        classification
            .classic_reasons
            .push("project hints biber backend; classic toolchain required".to_string());
    }

    classification
}

/// Lowercased concatenation of the main source and every text tex-like file.
fn build_corpus(main_content: &str, files: &[FileEntry]) -> String {
    let mut corpus = String::new();
    if !main_content.is_empty() {
        corpus.push_str(main_content);
        corpus.push('\n');
    }
    for file in files {
        if !file.is_text() || file.content.is_empty() {
            continue;
        }
        if file.kind() != FileKind::Tex {
            continue;
        }
        corpus.push_str(&file.content);
        corpus.push('\n');
    }
    corpus.to_lowercase()
}

fn first_match<'a>(corpus: &str, triggers: &[&'a str]) -> Option<&'a str> {
    triggers.iter().copied().find(|t| corpus.contains(*t))
}

fn detect_xe_trigger(corpus: &str) -> Option<String> {
    if contains_usepackage(corpus, "fontspec") {
        return Some("\\usepackage{fontspec}".to_string());
    }
    first_match(corpus, XE_TRIGGERS).map(String::from)
}

fn detect_shell_escape(corpus: &str) -> Option<String> {
    if SHELL_ESCAPE_SIGNALS.iter().any(|s| corpus.contains(s)) {
        return Some("shell-escape directive detected".to_string());
    }

    let packages = extract_packages(corpus);
    SHELL_ESCAPE_PACKAGES
        .iter()
        .find(|pkg| packages.contains(**pkg))
        .map(|pkg| format!("package {pkg} requires shell-escape"))
}

fn uses_python_tex(corpus: &str) -> bool {
    contains_usepackage(corpus, "pythontex")
        || PYTHON_TEX_ENVIRONMENTS.iter().any(|env| corpus.contains(env))
}

fn engine_directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^%\s*!tex\s+program\s*=\s*(\S+)").expect("static regex"))
}

fn usepackage_list_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{([^}]*)\}").expect("static regex"))
}

/// `% !TEX program = <engine>` directive, lowercased.
fn detect_engine_directive(corpus: &str) -> Option<String> {
    engine_directive_regex()
        .captures(corpus)
        .map(|caps| caps[1].trim().to_string())
}

fn directive_requires_classic(engine: &str) -> bool {
    !matches!(engine, "pdflatex" | "tectonic" | "")
}

/// Whether `pkg` is imported via `\usepackage` or `\RequirePackage`.
///
/// Compiled patterns are memoized per package name; the same handful of
/// packages is probed on every request.
#[must_use]
pub fn contains_usepackage(corpus: &str, pkg: &str) -> bool {
    if pkg.is_empty() {
        return false;
    }

    static CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    let mut cache = cache.lock().expect("usepackage pattern cache poisoned");
    let re = cache.entry(pkg.to_string()).or_insert_with(|| {
        let pattern = format!(
            r"\\(?:use|require)package(?:\[[^\]]*\])?\{{\s*{}\s*\}}",
            regex::escape(pkg)
        );
        Regex::new(&pattern).expect("usepackage pattern")
    });
    re.is_match(corpus)
}

/// Every package named in a `\usepackage[...]{a, b, c}` import, lowercased.
fn extract_packages(corpus: &str) -> HashSet<String> {
    let mut packages = HashSet::new();
    for caps in usepackage_list_regex().captures_iter(corpus) {
        for pkg in caps[1].split(',') {
            let trimmed = pkg.trim().to_lowercase();
            if !trimmed.is_empty() {
                packages.insert(trimmed);
            }
        }
    }
    packages
}
