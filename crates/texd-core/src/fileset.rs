//! Request file-set model.
//!
//! A compile request carries an ordered list of named files. Paths are
//! forward-slash relative and are validated before anything touches the
//! filesystem; ordering is preserved end to end so that the content
//! fingerprint is a pure function of the request bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a file's `content` string is encoded on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// UTF-8 text, stored verbatim.
    #[default]
    Text,
    /// Standard base64, decoded before writing to the workspace.
    Base64,
}

/// A single named file in a compile request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Forward-slash relative path inside the workspace.
    pub path: String,

    /// File content, encoded per `encoding`.
    pub content: String,

    /// Content encoding. Defaults to text when absent.
    #[serde(default)]
    pub encoding: Encoding,
}

impl FileEntry {
    /// Create a text file entry.
    #[must_use]
    pub fn text(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            encoding: Encoding::Text,
        }
    }

    /// Create a base64-encoded binary file entry.
    #[must_use]
    pub fn base64(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            encoding: Encoding::Base64,
        }
    }

    /// Whether this entry is plain text.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self.encoding, Encoding::Text)
    }

    /// Decode the content into raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FilesetError::InvalidBase64`] when a base64 entry does not
    /// decode.
    pub fn decoded_content(&self) -> Result<Vec<u8>, FilesetError> {
        match self.encoding {
            Encoding::Text => Ok(self.content.as_bytes().to_vec()),
            Encoding::Base64 => {
                BASE64
                    .decode(self.content.as_bytes())
                    .map_err(|source| FilesetError::InvalidBase64 {
                        path: self.path.clone(),
                        source,
                    })
            },
        }
    }

    /// Suffix classification of this entry.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        FileKind::of_path(&self.path)
    }
}

/// Suffix group a path belongs to, for change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// LaTeX sources: `.tex`, `.sty`, `.cls`, `.ltx`.
    Tex,
    /// Bibliography databases: `.bib`.
    Bib,
    /// Everything else (images, fonts, data files).
    Asset,
}

impl FileKind {
    /// Classify a path by its suffix. Unknown suffixes are assets.
    #[must_use]
    pub fn of_path(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".tex")
            || lower.ends_with(".sty")
            || lower.ends_with(".cls")
            || lower.ends_with(".ltx")
        {
            Self::Tex
        } else if lower.ends_with(".bib") {
            Self::Bib
        } else {
            Self::Asset
        }
    }
}

/// Errors produced while validating or decoding a request file set.
#[derive(Debug, Error)]
pub enum FilesetError {
    /// The request carried no files at all.
    #[error("the files array must contain at least one file")]
    Empty,

    /// A path is absolute, empty, or escapes the workspace.
    #[error("invalid file path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path as received.
        path: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Two entries share the same path.
    #[error("duplicate file path {path:?}")]
    DuplicatePath {
        /// The duplicated path.
        path: String,
    },

    /// A base64 entry did not decode.
    #[error("file {path:?} is not valid base64")]
    InvalidBase64 {
        /// Path of the undecodable entry.
        path: String,
        /// Decoder error.
        source: base64::DecodeError,
    },
}

/// Validate a request file set: non-empty, safe unique paths, decodable
/// base64 content.
///
/// # Errors
///
/// Returns the first [`FilesetError`] encountered, in request order.
pub fn validate_files(files: &[FileEntry]) -> Result<(), FilesetError> {
    if files.is_empty() {
        return Err(FilesetError::Empty);
    }

    let mut seen = std::collections::HashSet::with_capacity(files.len());
    for file in files {
        check_relative_path(&file.path)?;
        if !seen.insert(file.path.as_str()) {
            return Err(FilesetError::DuplicatePath {
                path: file.path.clone(),
            });
        }
        if !file.is_text() {
            // Decode eagerly so a bad payload fails before admission.
            file.decoded_content()?;
        }
    }

    Ok(())
}

/// Reject absolute paths, parent traversal and empty segments.
fn check_relative_path(path: &str) -> Result<(), FilesetError> {
    if path.is_empty() {
        return Err(FilesetError::InvalidPath {
            path: path.to_string(),
            reason: "path is empty",
        });
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(FilesetError::InvalidPath {
            path: path.to_string(),
            reason: "path must be relative with forward slashes",
        });
    }
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(FilesetError::InvalidPath {
                path: path.to_string(),
                reason: "path contains an empty segment",
            });
        }
        if segment == ".." {
            return Err(FilesetError::InvalidPath {
                path: path.to_string(),
                reason: "path escapes the workspace",
            });
        }
    }
    Ok(())
}

/// Locate the main LaTeX source of a file set.
///
/// Prefers the first text `.tex` entry containing `\documentclass`; falls
/// back to the first text `.tex` entry. The boolean reports whether
/// `\documentclass` was actually seen, for logging.
#[must_use]
pub fn find_main_file(files: &[FileEntry]) -> Option<(&FileEntry, bool)> {
    let mut fallback = None;

    for file in files {
        if !file.is_text() || !file.path.to_ascii_lowercase().ends_with(".tex") {
            continue;
        }
        if file.content.contains("\\documentclass") {
            return Some((file, true));
        }
        if fallback.is_none() {
            fallback = Some(file);
        }
    }

    fallback.map(|file| (file, false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_suffix_groups() {
        assert_eq!(FileKind::of_path("main.tex"), FileKind::Tex);
        assert_eq!(FileKind::of_path("style/custom.STY"), FileKind::Tex);
        assert_eq!(FileKind::of_path("refs.bib"), FileKind::Bib);
        assert_eq!(FileKind::of_path("figures/plot.png"), FileKind::Asset);
        assert_eq!(FileKind::of_path("Makefile"), FileKind::Asset);
    }

    #[test]
    fn validates_safe_paths() {
        let files = vec![
            FileEntry::text("main.tex", "x"),
            FileEntry::text("chapters/intro.tex", "y"),
        ];
        assert!(validate_files(&files).is_ok());
    }

    #[test]
    fn rejects_empty_set() {
        assert!(matches!(validate_files(&[]), Err(FilesetError::Empty)));
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        for bad in ["../evil.tex", "a/../../b.tex", "/etc/passwd", "a//b.tex", ""] {
            let files = vec![FileEntry::text(bad, "x")];
            assert!(
                matches!(validate_files(&files), Err(FilesetError::InvalidPath { .. })),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_duplicate_paths() {
        let files = vec![FileEntry::text("main.tex", "a"), FileEntry::text("main.tex", "b")];
        assert!(matches!(
            validate_files(&files),
            Err(FilesetError::DuplicatePath { .. })
        ));
    }

    #[test]
    fn rejects_undecodable_base64() {
        let files = vec![FileEntry::base64("img.png", "not base64!!!")];
        assert!(matches!(
            validate_files(&files),
            Err(FilesetError::InvalidBase64 { .. })
        ));
    }

    #[test]
    fn decodes_base64_content() {
        let entry = FileEntry::base64("img.bin", BASE64.encode(b"\x89PNG"));
        assert_eq!(entry.decoded_content().unwrap(), b"\x89PNG");
    }

    #[test]
    fn main_file_prefers_documentclass() {
        let files = vec![
            FileEntry::text("preamble.tex", "\\usepackage{amsmath}"),
            FileEntry::text("main.tex", "\\documentclass{article}"),
        ];
        let (main, has_docclass) = find_main_file(&files).unwrap();
        assert_eq!(main.path, "main.tex");
        assert!(has_docclass);
    }

    #[test]
    fn main_file_falls_back_to_first_tex() {
        let files = vec![
            FileEntry::text("refs.bib", "@article{k}"),
            FileEntry::text("body.tex", "hello"),
        ];
        let (main, has_docclass) = find_main_file(&files).unwrap();
        assert_eq!(main.path, "body.tex");
        assert!(!has_docclass);
    }

    #[test]
    fn main_file_missing_when_no_tex() {
        let files = vec![FileEntry::text("refs.bib", "@article{k}")];
        assert!(find_main_file(&files).is_none());
    }
}
