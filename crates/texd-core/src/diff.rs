//! File-diff engine driving incremental compiles.
//!
//! Compares an incoming file set against the hash map stored with the
//! previous successful build and reports per-path add/modify/delete sets
//! plus coarse change-category flags the strategy selector consumes.

use std::collections::BTreeMap;

use crate::fileset::{FileEntry, FileKind};
use crate::fingerprint::Fingerprint;

/// Changes between the current request and the cached build.
#[derive(Debug, Clone, Default)]
pub struct FileChanges {
    /// Files present now that the cached build never saw.
    pub added: Vec<FileEntry>,
    /// Files whose content digest differs from the cached one.
    pub modified: Vec<FileEntry>,
    /// Paths the cached build had that are gone from the request.
    pub deleted: Vec<String>,
    /// Any added/modified/deleted path in the `.tex/.sty/.cls/.ltx` group.
    pub has_tex_changes: bool,
    /// Any changed `.bib` path.
    pub has_bib_changes: bool,
    /// Any changed path outside the tex and bib groups.
    pub has_asset_changes: bool,
}

impl FileChanges {
    /// True when nothing was added, modified or deleted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Total number of changed paths.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }

    fn flag_path(&mut self, path: &str) {
        match FileKind::of_path(path) {
            FileKind::Tex => self.has_tex_changes = true,
            FileKind::Bib => self.has_bib_changes = true,
            FileKind::Asset => self.has_asset_changes = true,
        }
    }
}

/// Diff `current` against the cached `path -> digest` map.
///
/// Entries absent from the cache are added; entries whose digest differs
/// are modified; cached paths missing from the request are deleted.
/// Untouched files contribute nothing, including to the category flags.
#[must_use]
pub fn diff_files(
    current: &[FileEntry],
    cached: &BTreeMap<String, Fingerprint>,
) -> FileChanges {
    let mut changes = FileChanges::default();

    for file in current {
        match cached.get(&file.path) {
            None => {
                changes.flag_path(&file.path);
                changes.added.push(file.clone());
            },
            Some(digest) if *digest != Fingerprint::of_content(&file.content) => {
                changes.flag_path(&file.path);
                changes.modified.push(file.clone());
            },
            Some(_) => {},
        }
    }

    for path in cached.keys() {
        if !current.iter().any(|file| file.path == *path) {
            changes.flag_path(path);
            changes.deleted.push(path.clone());
        }
    }

    changes
}
