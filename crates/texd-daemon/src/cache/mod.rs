//! Project-scoped incremental compile cache.
//!
//! The cache maps project ids to the outcome of their last successful
//! compile: the PDF bytes and digest, a per-file hash map for diffing, and
//! the on-disk workspace that later requests reuse for incremental builds.
//! It also owns the per-project locks that serialize all compile activity
//! for a single project.
//!
//! Lock hierarchy, acquired in this order and released in reverse:
//!
//! 1. the global entries guard (read for lookups, write for
//!    insert/evict/sweep),
//! 2. the per-project lock,
//! 3. the per-entry lock guarding the access time.
//!
//! The global guard is never held while waiting on a project lock. Both
//! eviction paths (insert-time LRU and the expiry sweeper) take the write
//! guard but only ever *probe* project locks; an entry whose project lock
//! is held belongs to an in-flight compile and is skipped.

pub mod session;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use texd_core::fingerprint::Fingerprint;

/// Maximum number of projects kept in the cache.
pub const DEFAULT_MAX_PROJECTS: usize = 15;

/// Entries idle longer than this are evicted by the sweeper.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(30 * 60);

/// How often the expiry sweeper runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Cache sizing and expiry knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bound on the number of cached projects.
    pub max_entries: usize,
    /// Idle time after which an entry expires.
    pub expiry: Duration,
    /// Sweeper period.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_PROJECTS,
            expiry: DEFAULT_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A cached compilation for one project.
#[derive(Debug)]
pub struct CacheEntry {
    /// Owning project id.
    pub project_id: String,
    /// Workspace directory from the last successful compile. `None` for
    /// stateless builds that keep no workspace.
    pub workspace_dir: Option<PathBuf>,
    /// Per-file content digests, for the diff engine.
    pub file_hashes: BTreeMap<String, Fingerprint>,
    /// Fingerprint of the whole file set that produced the PDF.
    pub content_fingerprint: Fingerprint,
    /// The compiled PDF.
    pub pdf_data: Vec<u8>,
    /// Lowercase-hex SHA-256 of the PDF.
    pub pdf_sha256: String,
    /// Which engine produced the PDF (observability only).
    pub engine_tag: String,
    /// Access time, guarded separately so reads under the global read
    /// guard can still touch it.
    last_access: StdMutex<Instant>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        workspace_dir: Option<PathBuf>,
        file_hashes: BTreeMap<String, Fingerprint>,
        content_fingerprint: Fingerprint,
        pdf_data: Vec<u8>,
        pdf_sha256: impl Into<String>,
        engine_tag: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            workspace_dir,
            file_hashes,
            content_fingerprint,
            pdf_data,
            pdf_sha256: pdf_sha256.into(),
            engine_tag: engine_tag.into(),
            last_access: StdMutex::new(Instant::now()),
        }
    }

    /// Stamp the entry as just used.
    pub fn touch(&self) {
        *self.last_access.lock().expect("entry access time poisoned") = Instant::now();
    }

    /// When the entry was last served or stored.
    #[must_use]
    pub fn last_access(&self) -> Instant {
        *self.last_access.lock().expect("entry access time poisoned")
    }
}

/// Counters reported by the stats endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Current number of cached projects.
    pub entries: usize,
    /// Configured bound.
    pub max_entries: usize,
    /// Configured expiry, in minutes.
    pub expiration_minutes: u64,
}

/// The process-wide compilation cache.
///
/// Constructed explicitly and injected into the handler state; tests build
/// one per test with their own [`CacheConfig`].
#[derive(Debug)]
pub struct CompilationCache {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    project_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    config: CacheConfig,
}

impl CompilationCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            project_locks: StdMutex::new(HashMap::new()),
            config,
        }
    }

    /// The configured expiry.
    #[must_use]
    pub fn expiry(&self) -> Duration {
        self.config.expiry
    }

    /// Acquire the lock serializing all compile activity for one project.
    ///
    /// The first caller for an id allocates the lock; later callers share
    /// it. Empty project ids take no lock. The guard releases on drop and
    /// must not be re-acquired by its holder.
    pub async fn lock_project(&self, project_id: &str) -> Option<OwnedMutexGuard<()>> {
        if project_id.is_empty() {
            return None;
        }

        let lock = {
            let mut locks = self
                .project_locks
                .lock()
                .expect("project lock map poisoned");
            Arc::clone(locks.entry(project_id.to_string()).or_default())
        };

        Some(lock.lock_owned().await)
    }

    /// Look up a project's entry, touching its access time on hit.
    ///
    /// The returned entry is shared; only its own lock may mutate it.
    pub async fn get(&self, project_id: &str) -> Option<Arc<CacheEntry>> {
        if project_id.is_empty() {
            return None;
        }

        let entries = self.entries.read().await;
        let entry = entries.get(project_id).cloned();
        if let Some(entry) = &entry {
            entry.touch();
        }
        entry
    }

    /// Insert or replace a project's entry.
    ///
    /// An insert that would exceed the capacity bound first evicts the
    /// least-recently-accessed entry whose project lock is free, releasing
    /// its workspace. Replacing an existing entry never evicts; if the
    /// replacement moved to a different workspace the old directory is
    /// released.
    pub async fn insert(&self, entry: CacheEntry) {
        if entry.project_id.is_empty() {
            return;
        }
        entry.touch();

        let project_id = entry.project_id.clone();
        let new_dir = entry.workspace_dir.clone();

        let mut entries = self.entries.write().await;

        if !entries.contains_key(&project_id) && entries.len() >= self.config.max_entries {
            self.evict_oldest_locked(&mut entries).await;
        }

        if let Some(old) = entries.insert(project_id, Arc::new(entry)) {
            if let Some(old_dir) = &old.workspace_dir {
                if new_dir.as_deref() != Some(old_dir.as_path()) {
                    remove_workspace(old_dir.clone()).await;
                }
            }
        }
    }

    /// Whether `fingerprint` matches the entry stored for `project_id`.
    pub async fn check_fingerprint(&self, project_id: &str, fingerprint: &Fingerprint) -> bool {
        match self.get(project_id).await {
            Some(entry) => entry.content_fingerprint == *fingerprint,
            None => false,
        }
    }

    /// Current cache counters.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.len(),
            max_entries: self.config.max_entries,
            expiration_minutes: self.config.expiry.as_secs() / 60,
        }
    }

    /// Evict every entry idle past the configured expiry.
    ///
    /// Entries whose project lock is currently held are skipped: a held
    /// lock means a compile is running against that workspace right now,
    /// and removing it mid-build would pull the directory out from under
    /// the session. Returns the number of entries evicted.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access()) > self.config.expiry)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = 0;
        for project_id in expired {
            let probe = {
                let locks = self
                    .project_locks
                    .lock()
                    .expect("project lock map poisoned");
                locks.get(&project_id).cloned()
            };

            match probe {
                Some(lock) => match lock.try_lock_owned() {
                    Ok(guard) => {
                        self.remove_entry_inner(&mut entries, &project_id).await;
                        drop(guard);
                        self.release_project_lock_if_idle(&project_id);
                        info!(project_id = %project_id, "evicted expired cache entry");
                        evicted += 1;
                    },
                    Err(_) => {
                        debug!(
                            project_id = %project_id,
                            "skipping expired entry with a live compile"
                        );
                    },
                },
                None => {
                    self.remove_entry_inner(&mut entries, &project_id).await;
                    info!(project_id = %project_id, "evicted expired cache entry");
                    evicted += 1;
                },
            }
        }

        if evicted > 0 {
            info!(evicted, remaining = entries.len(), "cache sweep completed");
        }
        evicted
    }

    /// Spawn the background sweeper task for this cache.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh daemon
            // does not sweep an empty cache at startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        })
    }

    /// Evict the least-recently-used entry whose project lock is free.
    /// Caller holds the write guard.
    ///
    /// Candidates are probed oldest-first with a try-lock, the same skip
    /// the sweeper applies: a held lock means a compile is running against
    /// that workspace, and deleting it mid-build would hand the directory
    /// to two owners at once. When every candidate is busy the bound is
    /// exceeded until the next insert.
    async fn evict_oldest_locked(&self, entries: &mut HashMap<String, Arc<CacheEntry>>) {
        let mut candidates: Vec<(String, Instant)> = entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.last_access()))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);

        for (project_id, _) in candidates {
            let probe = {
                let locks = self
                    .project_locks
                    .lock()
                    .expect("project lock map poisoned");
                locks.get(&project_id).cloned()
            };

            match probe {
                Some(lock) => match lock.try_lock_owned() {
                    Ok(guard) => {
                        self.remove_entry_inner(entries, &project_id).await;
                        drop(guard);
                        self.release_project_lock_if_idle(&project_id);
                        info!(project_id = %project_id, "evicted least-recently-used cache entry");
                        return;
                    },
                    Err(_) => {
                        debug!(
                            project_id = %project_id,
                            "skipping eviction of project with a live compile"
                        );
                    },
                },
                None => {
                    self.remove_entry_inner(entries, &project_id).await;
                    self.release_project_lock_if_idle(&project_id);
                    info!(project_id = %project_id, "evicted least-recently-used cache entry");
                    return;
                },
            }
        }

        debug!("every cached project has a live compile; capacity bound exceeded until the next insert");
    }

    /// Remove an entry and release its workspace. Caller holds the write
    /// guard. Disk errors are logged and swallowed so the in-memory map
    /// never keeps a reference the filesystem has lost.
    async fn remove_entry_inner(
        &self,
        entries: &mut HashMap<String, Arc<CacheEntry>>,
        project_id: &str,
    ) {
        if let Some(entry) = entries.remove(project_id) {
            if let Some(dir) = entry.workspace_dir.clone() {
                remove_workspace(dir).await;
            }
        }
    }

    /// Drop a project's lock entry when nothing holds or awaits it.
    ///
    /// A lock with live holders stays in the map; deleting it would let a
    /// later caller allocate a second lock for the same project and run two
    /// compiles concurrently.
    fn release_project_lock_if_idle(&self, project_id: &str) {
        let mut locks = self
            .project_locks
            .lock()
            .expect("project lock map poisoned");
        if let Some(lock) = locks.get(project_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(project_id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn project_lock_count(&self) -> usize {
        self.project_locks
            .lock()
            .expect("project lock map poisoned")
            .len()
    }
}

/// Best-effort recursive removal, run on the blocking pool so large
/// workspaces never stall the runtime threads.
async fn remove_workspace(dir: PathBuf) {
    let task = tokio::task::spawn_blocking(move || {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => debug!(dir = %dir.display(), "removed cached workspace"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => warn!(dir = %dir.display(), error = %err, "failed to remove workspace"),
        }
    });
    if task.await.is_err() {
        warn!("workspace removal task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(project_id: &str, workspace: Option<PathBuf>) -> CacheEntry {
        CacheEntry::new(
            project_id,
            workspace,
            BTreeMap::new(),
            Fingerprint::of_bytes(project_id),
            b"%PDF-1.5 fake".to_vec(),
            "abc123",
            "pdflatex",
        )
    }

    fn small_cache(max_entries: usize) -> CompilationCache {
        CompilationCache::new(CacheConfig {
            max_entries,
            expiry: DEFAULT_EXPIRY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        })
    }

    #[tokio::test]
    async fn get_returns_inserted_entry() {
        let cache = small_cache(15);
        cache.insert(entry("p1", None)).await;

        let got = cache.get("p1").await.expect("entry present");
        assert_eq!(got.project_id, "p1");
        assert!(cache.get("p2").await.is_none());
    }

    #[tokio::test]
    async fn empty_project_id_is_a_noop() {
        let cache = small_cache(15);
        cache.insert(entry("", None)).await;
        assert_eq!(cache.stats().await.entries, 0);
        assert!(cache.get("").await.is_none());
        assert!(cache.lock_project("").await.is_none());
    }

    #[tokio::test]
    async fn fingerprint_check_matches_stored_value() {
        let cache = small_cache(15);
        cache.insert(entry("p1", None)).await;

        assert!(cache.check_fingerprint("p1", &Fingerprint::of_bytes("p1")).await);
        assert!(!cache.check_fingerprint("p1", &Fingerprint::of_bytes("other")).await);
        assert!(!cache.check_fingerprint("missing", &Fingerprint::of_bytes("p1")).await);
    }

    #[tokio::test]
    async fn insert_past_capacity_evicts_lru_and_removes_workspace() {
        let cache = small_cache(2);

        let dir1 = tempfile::tempdir().unwrap().keep();
        let dir2 = tempfile::tempdir().unwrap().keep();

        cache.insert(entry("p1", Some(dir1.clone()))).await;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p2", Some(dir2.clone()))).await;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p3", None)).await;

        assert_eq!(cache.stats().await.entries, 2);
        assert!(cache.get("p1").await.is_none(), "oldest entry evicted");
        assert!(cache.get("p2").await.is_some());
        assert!(cache.get("p3").await.is_some());
        assert!(!dir1.exists(), "evicted workspace removed from disk");
        assert!(dir2.exists());

        std::fs::remove_dir_all(&dir2).ok();
    }

    #[tokio::test]
    async fn get_refreshes_lru_order() {
        let cache = small_cache(2);

        cache.insert(entry("p1", None)).await;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p2", None)).await;
        std::thread::sleep(Duration::from_millis(5));

        // Touch p1 so p2 becomes the eviction victim.
        cache.get("p1").await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p3", None)).await;

        assert!(cache.get("p1").await.is_some());
        assert!(cache.get("p2").await.is_none());
    }

    #[tokio::test]
    async fn replace_does_not_evict() {
        let cache = small_cache(1);
        cache.insert(entry("p1", None)).await;
        cache.insert(entry("p1", None)).await;
        assert_eq!(cache.stats().await.entries, 1);
        assert!(cache.get("p1").await.is_some());
    }

    #[tokio::test]
    async fn replace_releases_superseded_workspace() {
        let cache = small_cache(15);
        let old_dir = tempfile::tempdir().unwrap().keep();
        let new_dir = tempfile::tempdir().unwrap().keep();

        cache.insert(entry("p1", Some(old_dir.clone()))).await;
        cache.insert(entry("p1", Some(new_dir.clone()))).await;

        assert!(!old_dir.exists());
        assert!(new_dir.exists());
        std::fs::remove_dir_all(&new_dir).ok();
    }

    #[tokio::test]
    async fn project_lock_serializes_holders() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache = Arc::new(small_cache(15));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let concurrent = Arc::clone(&concurrent);
            handles.push(tokio::spawn(async move {
                let _guard = cache.lock_project("p1").await.unwrap();
                let inside = concurrent.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0, "no two holders inside the critical section");
                tokio::time::sleep(Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let cache = CompilationCache::new(CacheConfig {
            max_entries: 15,
            expiry: Duration::from_millis(1),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        });

        let dir = tempfile::tempdir().unwrap().keep();
        cache.insert(entry("p1", Some(dir.clone()))).await;
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.sweep_expired().await, 1);
        assert_eq!(cache.stats().await.entries, 0);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn sweep_skips_projects_with_live_compiles() {
        let cache = CompilationCache::new(CacheConfig {
            max_entries: 15,
            expiry: Duration::from_millis(1),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        });

        cache.insert(entry("p1", None)).await;
        std::thread::sleep(Duration::from_millis(5));

        let guard = cache.lock_project("p1").await.unwrap();
        assert_eq!(cache.sweep_expired().await, 0, "busy project skipped");
        assert!(cache.get("p1").await.is_some());

        drop(guard);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep_expired().await, 1);
        assert!(cache.get("p1").await.is_none());
    }

    #[tokio::test]
    async fn idle_project_locks_are_reclaimed_on_eviction() {
        let cache = CompilationCache::new(CacheConfig {
            max_entries: 15,
            expiry: Duration::from_millis(1),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        });

        {
            let _guard = cache.lock_project("p1").await.unwrap();
        }
        cache.insert(entry("p1", None)).await;
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.project_lock_count(), 1);
        cache.sweep_expired().await;
        assert_eq!(cache.project_lock_count(), 0);
    }

    #[tokio::test]
    async fn lru_eviction_skips_busy_project() {
        let cache = small_cache(1);
        let dir = tempfile::tempdir().unwrap().keep();

        let guard = cache.lock_project("p1").await.unwrap();
        cache.insert(entry("p1", Some(dir.clone()))).await;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p2", None)).await;

        // p1 is mid-compile: its entry and workspace survive, and the bound
        // is exceeded until the lock frees.
        assert!(cache.get("p1").await.is_some());
        assert!(cache.get("p2").await.is_some());
        assert_eq!(cache.stats().await.entries, 2);
        assert!(dir.exists(), "busy project keeps its workspace");
        assert_eq!(cache.project_lock_count(), 1, "held lock not deleted");

        drop(guard);
        std::thread::sleep(Duration::from_millis(5));
        cache.get("p2").await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p3", None)).await;

        assert!(cache.get("p1").await.is_none(), "freed project becomes evictable");
        assert!(!dir.exists());
        assert_eq!(cache.stats().await.entries, 2, "one eviction per insert");
    }

    #[tokio::test]
    async fn lru_eviction_falls_through_to_next_oldest() {
        let cache = small_cache(2);

        let guard = cache.lock_project("p1").await.unwrap();
        cache.insert(entry("p1", None)).await;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p2", None)).await;
        std::thread::sleep(Duration::from_millis(5));
        cache.insert(entry("p3", None)).await;

        // p1 is the oldest but busy; p2 is the next-oldest free victim.
        assert!(cache.get("p1").await.is_some());
        assert!(cache.get("p2").await.is_none());
        assert!(cache.get("p3").await.is_some());
        drop(guard);
    }

    #[tokio::test]
    async fn stats_reports_configuration() {
        let cache = small_cache(15);
        let stats = cache.stats().await;
        assert_eq!(
            stats,
            CacheStats {
                entries: 0,
                max_entries: 15,
                expiration_minutes: 30
            }
        );
    }
}
