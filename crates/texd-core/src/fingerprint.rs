//! Content-addressed fingerprints over request file sets.
//!
//! The file-set fingerprint is the cache key for exact-match PDF reuse: two
//! requests with identical `(path, content)` pairs in the same order hash to
//! the same value, across processes and runs. No timestamps, no randomness.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::fileset::FileEntry;

/// A stable SHA-256 digest stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the SHA-256 fingerprint of an arbitrary byte slice.
    #[must_use]
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Per-file digest over the content string as received.
    #[must_use]
    pub fn of_content(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    /// Fingerprint of a whole file set.
    ///
    /// Hashes the sequence `(path, 0x00, content, 0x00)` per entry in
    /// request order, so the result is a pure function of the request and
    /// entry order is significant.
    #[must_use]
    pub fn of_file_set(files: &[FileEntry]) -> Self {
        let mut hasher = Sha256::new();
        for file in files {
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(file.content.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// The lowercase hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Build the `path -> content digest` map the diff engine consumes.
#[must_use]
pub fn build_file_hash_map(files: &[FileEntry]) -> BTreeMap<String, Fingerprint> {
    files
        .iter()
        .map(|file| (file.path.clone(), Fingerprint::of_content(&file.content)))
        .collect()
}
