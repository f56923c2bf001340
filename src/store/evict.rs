//! Age- and size-bounded eviction
//!
//! Entries are visited strictly oldest-access-first. An entry whose lock
//! is held by anyone is skipped, never waited for; it is simply retried on
//! a later pass. Stale entry locks are reaped first, like on any other
//! acquire. Removing an entry deletes its archive, metadata, lock and
//! lock side record while holding the entry's exclusive lock.

use crate::error::{TreeCacheError, TreeCacheResult};
use crate::store::lock::{LockInfo, LockManager, LockMode, StaleOutcome};
use crate::store::lru::LruIndex;
use crate::store::topology::{
    key_from_archive_name, validate_name, CachePaths, EntryId, PARTIAL_SUFFIX,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// A published archive found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArchive {
    pub id: EntryId,
    pub bytes: u64,
    /// Archive mtime, seconds since the unix epoch
    pub modified: i64,
}

/// Everything found under a tier root
#[derive(Debug, Default, Clone)]
pub struct TierScan {
    pub archives: Vec<StoredArchive>,
    /// Temporary files left behind by interrupted writers
    pub leftovers: Vec<(PathBuf, SystemTime)>,
}

impl TierScan {
    pub fn total_bytes(&self) -> u64 {
        self.archives.iter().map(|a| a.bytes).sum()
    }
}

/// List archives and leftover temporaries, optionally for one cache type
pub fn scan_tier(paths: &CachePaths, cache_type: Option<&str>) -> TreeCacheResult<TierScan> {
    let mut scan = TierScan::default();
    let root = paths.root();

    let types = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(TreeCacheError::io(format!("reading {}", root.display()), e)),
    };

    for type_entry in types.filter_map(|e| e.ok()) {
        let type_name = type_entry.file_name().to_string_lossy().into_owned();
        if validate_name("type", &type_name).is_err() || !type_entry.path().is_dir() {
            continue;
        }
        if cache_type.is_some_and(|t| t != type_name) {
            continue;
        }

        let dir = type_entry.path();
        let files = fs::read_dir(&dir)
            .map_err(|e| TreeCacheError::io(format!("reading {}", dir.display()), e))?;

        for file in files.filter_map(|e| e.ok()) {
            let name = file.file_name().to_string_lossy().into_owned();
            let Ok(meta) = file.metadata() else { continue };
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);

            if name.ends_with(PARTIAL_SUFFIX) || name.ends_with(".tmp") {
                scan.leftovers.push((file.path(), modified));
                continue;
            }
            if let Some(key) = key_from_archive_name(&name) {
                if let Ok(id) = EntryId::new(type_name.clone(), key) {
                    scan.archives.push(StoredArchive {
                        id,
                        bytes: meta.len(),
                        modified: modified
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0),
                    });
                }
            }
        }
    }

    scan.archives.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(scan)
}

/// Eviction limits for one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupRequest {
    pub cache_type: Option<String>,
    /// Remove oldest entries while usage exceeds this
    pub max_size_bytes: Option<u64>,
    /// Remove entries not accessed for at least this long
    pub max_age: Option<Duration>,
}

/// A stale entry lock broken so its entry could be evicted
#[derive(Debug, Clone, Serialize)]
pub struct BrokenLock {
    pub id: EntryId,
    pub holder: Option<LockInfo>,
}

/// What an eviction pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<EntryId>,
    pub skipped_locked: Vec<EntryId>,
    pub broken_locks: Vec<BrokenLock>,
    pub reclaimed_partials: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

enum Removal {
    Removed,
    Locked,
}

/// Evicts entries from one tier
#[derive(Debug, Clone)]
pub struct Evictor {
    paths: CachePaths,
    locks: LockManager,
    index: LruIndex,
}

impl Evictor {
    pub fn new(paths: CachePaths, locks: LockManager) -> Self {
        let index = LruIndex::new(paths.clone(), locks.clone());
        Self {
            paths,
            locks,
            index,
        }
    }

    /// Run one eviction pass
    pub async fn cleanup(&self, request: CleanupRequest) -> TreeCacheResult<CleanupReport> {
        let access = self.index.access_times()?;
        let sweeper = self.clone();
        let (report, removed) =
            tokio::task::spawn_blocking(move || sweeper.sweep(&request, &access)).await??;

        if let Err(e) = self.index.forget(&removed).await {
            warn!(
                "Evicted {} entries but could not update {}: {}",
                removed.len(),
                self.paths.index().display(),
                e
            );
        }

        info!(
            "Cleanup of {}: removed {}, skipped {} in use, reclaimed {} partial(s), {} bytes freed",
            self.paths.root().display(),
            report.removed.len(),
            report.skipped_locked.len(),
            report.reclaimed_partials,
            report.freed_bytes
        );
        Ok(report)
    }

    fn sweep(
        &self,
        request: &CleanupRequest,
        access: &HashMap<EntryId, i64>,
    ) -> TreeCacheResult<(CleanupReport, HashMap<EntryId, i64>)> {
        let scan = scan_tier(&self.paths, request.cache_type.as_deref())?;
        let mut report = CleanupReport {
            reclaimed_partials: self.reclaim_leftovers(&scan),
            ..CleanupReport::default()
        };

        let mut candidates: Vec<(i64, StoredArchive)> = scan
            .archives
            .into_iter()
            .map(|a| (access.get(&a.id).copied().unwrap_or(a.modified), a))
            .collect();
        candidates.sort_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| a.id.cmp(&b.id)));

        let mut total: u64 = candidates.iter().map(|(_, a)| a.bytes).sum();
        let now = Utc::now().timestamp();
        let mut removed = HashMap::new();

        for (last_access, archive) in candidates {
            let age = now.saturating_sub(last_access).max(0) as u64;
            let too_old = request.max_age.is_some_and(|max| age >= max.as_secs());
            let too_big = request.max_size_bytes.is_some_and(|max| total > max);
            if !too_old && !too_big {
                continue;
            }

            // A hung holder would otherwise pin its entry forever
            let lock = self.paths.lock(&archive.id);
            if let StaleOutcome::Broken(holder) = self.locks.reap_if_stale(&lock)? {
                report.broken_locks.push(BrokenLock {
                    id: archive.id.clone(),
                    holder,
                });
            }

            match self.remove_entry(&archive.id)? {
                Removal::Removed => {
                    debug!(
                        "Evicted {} ({} bytes, idle {}s)",
                        archive.id, archive.bytes, age
                    );
                    total = total.saturating_sub(archive.bytes);
                    report.freed_bytes += archive.bytes;
                    report.removed.push(archive.id.clone());
                    removed.insert(archive.id, last_access);
                }
                Removal::Locked => {
                    info!("Skipping {}: entry is in use", archive.id);
                    report.skipped_locked.push(archive.id);
                }
            }
        }

        report.remaining_bytes = total;
        Ok((report, removed))
    }

    /// Remove every file of an entry, or nothing if it is locked
    fn remove_entry(&self, id: &EntryId) -> TreeCacheResult<Removal> {
        let guard = match self
            .locks
            .try_acquire(&self.paths.lock(id), LockMode::Exclusive)?
        {
            Some(guard) => guard,
            None => return Ok(Removal::Locked),
        };

        let archive = self.paths.archive(id);
        match fs::remove_file(&archive) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TreeCacheError::io(
                    format!("removing {}", archive.display()),
                    e,
                ))
            }
        }

        let metadata = self.paths.metadata(id);
        if let Err(e) = fs::remove_file(&metadata) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", metadata.display(), e);
            }
        }
        if let Err(e) = guard.remove_files() {
            warn!("Could not remove lock files for {}: {}", id, e);
        }
        Ok(Removal::Removed)
    }

    /// Delete temporaries older than the stale-lock threshold
    fn reclaim_leftovers(&self, scan: &TierScan) -> usize {
        let threshold = self.locks.config().stale_after();
        let now = SystemTime::now();
        scan.leftovers
            .iter()
            .filter(|(_, modified)| {
                now.duration_since(*modified).unwrap_or_default() >= threshold
            })
            .filter(|(path, _)| match fs::remove_file(path) {
                Ok(()) => {
                    debug!("Reclaimed orphaned temporary {}", path.display());
                    true
                }
                Err(e) => {
                    warn!("Could not reclaim {}: {}", path.display(), e);
                    false
                }
            })
            .count()
    }
}
