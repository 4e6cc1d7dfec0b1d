//! Scoped cache access for one request.
//!
//! A [`CacheSession`] is the only place a live request may touch the
//! cache. Acquiring it takes the per-project lock; the lock is released
//! when the session drops, so no exit path - early return, error, panic -
//! can leave a project locked.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use texd_core::diff::{FileChanges, diff_files};
use texd_core::fileset::FileEntry;
use texd_core::fingerprint::{Fingerprint, build_file_hash_map};

use crate::cache::{CacheEntry, CompilationCache};
use crate::compile::{CompileResult, millis_since};

/// A cached workspace ready for an incremental build.
#[derive(Debug)]
pub struct IncrementalWorkspace {
    /// The workspace directory, still owned by the cache.
    pub workspace_dir: PathBuf,
    /// Diff between the request and the cached build.
    pub changes: FileChanges,
}

/// Scoped handle binding one `(project, request)` pair to the cache.
pub struct CacheSession {
    cache: Arc<CompilationCache>,
    project_id: String,
    _project_guard: Option<OwnedMutexGuard<()>>,
}

impl CacheSession {
    /// Acquire the session, blocking until the project lock is free.
    ///
    /// Requests without a project id get a lock-free session whose cache
    /// operations are all no-ops.
    pub async fn acquire(
        cache: Arc<CompilationCache>,
        project_id: &str,
        request_id: &str,
    ) -> Self {
        let guard = cache.lock_project(project_id).await;
        if guard.is_some() {
            debug!(request_id = %request_id, project_id = %project_id, "project lock acquired");
        }
        Self {
            cache,
            project_id: project_id.to_string(),
            _project_guard: guard,
        }
    }

    /// Whether this session is bound to a project.
    #[must_use]
    pub fn has_project(&self) -> bool {
        !self.project_id.is_empty()
    }

    /// Serve the cached PDF when the request's fingerprint matches the
    /// stored one and the cached bytes are non-empty.
    pub async fn try_serve_cached(
        &self,
        files: &[FileEntry],
        request_id: &str,
        queue_ms: u64,
        received_at: Instant,
    ) -> Option<CompileResult> {
        if !self.has_project() {
            return None;
        }

        let fingerprint = Fingerprint::of_file_set(files);
        if !self
            .cache
            .check_fingerprint(&self.project_id, &fingerprint)
            .await
        {
            return None;
        }

        let entry = self.cache.get(&self.project_id).await?;
        if entry.pdf_data.is_empty() {
            return None;
        }

        info!(
            request_id = %request_id,
            project_id = %self.project_id,
            "cache hit: content unchanged, serving cached PDF"
        );

        Some(CompileResult::success(
            request_id,
            entry.pdf_data.clone(),
            entry.pdf_sha256.clone(),
            queue_ms,
            millis_since(received_at),
            true,
        ))
    }

    /// Hand back the cached workspace and the diff against it, when the
    /// entry still has a directory and the directory is still on disk.
    pub async fn prepare_incremental_workspace(
        &self,
        files: &[FileEntry],
    ) -> Option<IncrementalWorkspace> {
        if !self.has_project() {
            return None;
        }

        let entry = self.cache.get(&self.project_id).await?;
        let workspace_dir = entry.workspace_dir.clone()?;

        if !workspace_dir.is_dir() {
            warn!(
                project_id = %self.project_id,
                dir = %workspace_dir.display(),
                "cached workspace unavailable on disk"
            );
            return None;
        }

        let changes = diff_files(files, &entry.file_hashes);
        Some(IncrementalWorkspace {
            workspace_dir,
            changes,
        })
    }

    /// Store a successful compile. The workspace directory, when present,
    /// becomes cache property with this call.
    pub async fn store(
        &self,
        files: &[FileEntry],
        workspace_dir: Option<PathBuf>,
        pdf_data: &[u8],
        pdf_sha256: &str,
        engine_tag: &str,
    ) {
        if !self.has_project() {
            return;
        }

        let entry = CacheEntry::new(
            self.project_id.clone(),
            workspace_dir,
            build_file_hash_map(files),
            Fingerprint::of_file_set(files),
            pdf_data.to_vec(),
            pdf_sha256,
            engine_tag,
        );
        self.cache.insert(entry).await;
        debug!(project_id = %self.project_id, "cached compilation result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    fn files() -> Vec<FileEntry> {
        vec![FileEntry::text(
            "main.tex",
            "\\documentclass{article}\\begin{document}A\\end{document}",
        )]
    }

    async fn seeded_cache(workspace: Option<PathBuf>) -> Arc<CompilationCache> {
        let cache = Arc::new(CompilationCache::new(CacheConfig::default()));
        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r0").await;
        session
            .store(&files(), workspace, b"%PDF-1.5 cached", "deadbeef", "pdflatex")
            .await;
        cache
    }

    #[tokio::test]
    async fn sessions_without_project_are_noops() {
        let cache = Arc::new(CompilationCache::new(CacheConfig::default()));
        let session = CacheSession::acquire(Arc::clone(&cache), "", "r1").await;

        assert!(!session.has_project());
        assert!(
            session
                .try_serve_cached(&files(), "r1", 0, Instant::now())
                .await
                .is_none()
        );
        assert!(session.prepare_incremental_workspace(&files()).await.is_none());

        session
            .store(&files(), None, b"%PDF-1.5", "deadbeef", "pdflatex")
            .await;
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn hit_requires_matching_fingerprint() {
        let cache = seeded_cache(None).await;
        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r1").await;

        let hit = session
            .try_serve_cached(&files(), "r1", 3, Instant::now())
            .await
            .expect("fingerprint matches");
        assert!(hit.success);
        assert!(hit.cache_hit);
        assert_eq!(hit.pdf_data, b"%PDF-1.5 cached");
        assert_eq!(hit.pdf_sha256, "deadbeef");
        assert_eq!(hit.queue_ms, 3);
        drop(session);

        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r2").await;
        let mut changed = files();
        changed[0].content.push('B');
        assert!(
            session
                .try_serve_cached(&changed, "r2", 0, Instant::now())
                .await
                .is_none(),
            "modified content must miss"
        );
    }

    #[tokio::test]
    async fn hit_requires_nonempty_pdf() {
        let cache = Arc::new(CompilationCache::new(CacheConfig::default()));
        {
            let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r0").await;
            session.store(&files(), None, b"", "deadbeef", "pdflatex").await;
        }

        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r1").await;
        assert!(
            session
                .try_serve_cached(&files(), "r1", 0, Instant::now())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn incremental_workspace_requires_directory_on_disk() {
        let gone = PathBuf::from("/tmp/texd-test-gone-workspace");
        let cache = seeded_cache(Some(gone)).await;
        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r1").await;
        assert!(session.prepare_incremental_workspace(&files()).await.is_none());
    }

    #[tokio::test]
    async fn incremental_workspace_reports_diff() {
        let dir = tempfile::tempdir().unwrap().keep();
        let cache = seeded_cache(Some(dir.clone())).await;
        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r1").await;

        let mut changed = files();
        changed[0].content.push('B');
        changed.push(FileEntry::text("refs.bib", "@article{k}"));

        let incremental = session
            .prepare_incremental_workspace(&changed)
            .await
            .expect("workspace available");
        assert_eq!(incremental.workspace_dir, dir);
        assert_eq!(incremental.changes.modified.len(), 1);
        assert_eq!(incremental.changes.added.len(), 1);
        assert!(incremental.changes.has_tex_changes);
        assert!(incremental.changes.has_bib_changes);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn entry_without_workspace_is_not_incremental() {
        let cache = seeded_cache(None).await;
        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r1").await;
        assert!(session.prepare_incremental_workspace(&files()).await.is_none());
    }

    #[tokio::test]
    async fn dropping_the_session_releases_the_project_lock() {
        let cache = Arc::new(CompilationCache::new(CacheConfig::default()));

        let session = CacheSession::acquire(Arc::clone(&cache), "p1", "r1").await;
        drop(session);

        // Re-acquiring immediately would deadlock if the lock leaked.
        let reacquired = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            CacheSession::acquire(Arc::clone(&cache), "p1", "r2"),
        )
        .await;
        assert!(reacquired.is_ok());
    }
}
