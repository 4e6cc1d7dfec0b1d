//! # texd-core
//!
//! Core library for texd - a LaTeX compilation service.
//!
//! This crate provides the pure building blocks the daemon composes into a
//! compile pipeline: the request file-set model, content-addressed
//! fingerprints, the file-diff engine that drives incremental builds, the
//! engine classifier, the compilation strategy selector, and the external
//! toolchain driver.
//!
//! ## Example
//!
//! ```rust
//! use texd_core::fileset::FileEntry;
//! use texd_core::fingerprint::Fingerprint;
//!
//! let files = vec![FileEntry::text("main.tex", "\\documentclass{article}")];
//! let fp = Fingerprint::of_file_set(&files);
//! assert_eq!(fp, Fingerprint::of_file_set(&files));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod classifier;
pub mod diff;
pub mod fileset;
pub mod fingerprint;
pub mod strategy;
pub mod toolchain;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::classifier::{EngineClassification, LatexEngine};
    pub use crate::diff::{FileChanges, diff_files};
    pub use crate::fileset::{Encoding, FileEntry, FileKind};
    pub use crate::fingerprint::Fingerprint;
    pub use crate::strategy::{BibliographyTool, CompileStrategy};
    pub use crate::toolchain::{ToolchainDriver, ToolchainRequest};
}

/// Re-export commonly used types at the crate root.
pub use classifier::{EngineClassification, LatexEngine};
pub use diff::FileChanges;
pub use fileset::{Encoding, FileEntry};
pub use fingerprint::Fingerprint;
pub use strategy::{BibliographyTool, CompileStrategy};
pub use toolchain::{ToolchainDriver, ToolchainOutput, ToolchainRequest};
