//! Cross-host advisory file locks with stale-lock recovery
//!
//! Locks are open-file-description byte-range locks (`F_OFD_SETLK`) on
//! Linux. The Linux NFS client forwards these to the server's lock
//! manager, so they hold across hosts sharing the mount, and unlike
//! classic POSIX record locks they conflict between two descriptors of the
//! same process. Other unix targets use `flock(2)`.
//!
//! A lock file whose mtime is older than `stale_after` is presumed to
//! belong to a killed job. Live holders refresh the mtime from a heartbeat
//! task, so only abandoned (or hung) holders ever look stale.

use crate::config::schema::LockConfig;
use crate::error::{TreeCacheError, TreeCacheResult};
use crate::host::{hostname, JobIdentity};
use chrono::{DateTime, Utc};
use rustix::fs::FlockOperation;
use rustix::io::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// Many concurrent readers
    Shared,
    /// Single writer, no readers
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Diagnostic side record written next to every acquired lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub host: String,
    pub pid: u32,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    #[serde(flatten)]
    pub job: JobIdentity,
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lock by pid {} on {} since {}",
            self.mode,
            self.pid,
            self.host,
            self.acquired_at.to_rfc3339()
        )?;
        if let Some(ref job) = self.job.job_id {
            write!(f, ", job {}", job)?;
        }
        if let Some(ref pipeline) = self.job.pipeline_id {
            write!(f, ", pipeline {}", pipeline)?;
        }
        Ok(())
    }
}

/// Path of the diagnostic side record for a lock file
pub fn info_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".info");
    PathBuf::from(name)
}

/// Path of the file that serialises stale-lock reaping
fn reap_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".reap");
    PathBuf::from(name)
}

/// Read a lock's side record, if present and parseable
pub fn read_info(lock_path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(info_path(lock_path)).ok()?;
    serde_json::from_str(&content).ok()
}

/// What the stale check found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleOutcome {
    /// Lock file missing or recently refreshed
    Fresh,
    /// Old and uncontended: residue of a terminated process, removed
    Residue,
    /// Old and still contended: forcibly broken
    Broken(Option<LockInfo>),
}

/// An acquired lock; released when dropped
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Release the lock
    pub fn release(self) {
        debug!("Released {} lock {}", self.mode, self.path.display());
    }

    /// Delete the lock file and its side record, then release
    ///
    /// Used when the guarded entry itself is being removed. Waiters that
    /// opened the old file notice the replaced inode and retry.
    pub fn remove_files(self) -> io::Result<()> {
        remove_if_exists(&info_path(&self.path))?;
        remove_if_exists(&reap_path(&self.path))?;
        remove_if_exists(&self.path)?;
        Ok(())
    }

    fn start_heartbeat(&mut self, interval: Duration) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let path = self.path.clone();
        let identity = file_identity(&self.file).ok();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = refresh_if_same(&path, identity) {
                    debug!("Lock heartbeat for {} failed: {}", path.display(), e);
                }
            }
        }));
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

/// Acquires entry and index locks according to the configured timing
#[derive(Debug, Clone)]
pub struct LockManager {
    config: LockConfig,
    host: String,
    job: JobIdentity,
}

impl LockManager {
    pub fn new(config: LockConfig, job: JobIdentity) -> Self {
        Self {
            config,
            host: hostname(),
            job,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire a lock, waiting up to the configured timeout
    ///
    /// Stale lock files are reaped before every attempt. Returns
    /// `LockTimeout` if the lock cannot be obtained in time; proceeding
    /// without the lock is never an option.
    pub async fn acquire(
        &self,
        path: &Path,
        mode: LockMode,
    ) -> TreeCacheResult<(LockGuard, StaleOutcome)> {
        self.acquire_within(path, mode, self.config.timeout()).await
    }

    /// Acquire a lock with an explicit timeout
    pub async fn acquire_within(
        &self,
        path: &Path,
        mode: LockMode,
        timeout: Duration,
    ) -> TreeCacheResult<(LockGuard, StaleOutcome)> {
        ensure_parent(path)?;
        let deadline = Instant::now() + timeout;
        let mut reaped = StaleOutcome::Fresh;

        loop {
            match self.reap_if_stale(path)? {
                StaleOutcome::Fresh => {}
                outcome => reaped = outcome,
            }

            if let Some(mut guard) = self.try_acquire(path, mode)? {
                if self.config.heartbeat {
                    guard.start_heartbeat(self.config.stale_after() / 4);
                }
                return Ok((guard, reaped));
            }

            if Instant::now() >= deadline {
                return Err(TreeCacheError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            debug!("Waiting for {} lock {}", mode, path.display());
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Single non-blocking attempt; `None` if the lock is contended
    pub fn try_acquire(&self, path: &Path, mode: LockMode) -> TreeCacheResult<Option<LockGuard>> {
        ensure_parent(path)?;
        let file = open_lock_file(path).map_err(|e| lock_err(path, e))?;

        if !try_lock(&file, mode).map_err(|e| lock_err(path, e))? {
            return Ok(None);
        }

        // Refreshed before the identity check, so a reaper that measures
        // the age after this point sees a fresh lock.
        if let Err(e) = file.set_modified(SystemTime::now()) {
            debug!("Could not refresh mtime of {}: {}", path.display(), e);
        }

        // The file may have been unlinked (stale break, eviction) between
        // open and lock; a lock on a detached inode protects nothing.
        let ours = file_identity(&file).map_err(|e| lock_err(path, e))?;
        match path_identity(path) {
            Ok(current) if current == ours => {}
            _ => {
                debug!("Lock file {} was replaced, retrying", path.display());
                return Ok(None);
            }
        }

        self.write_info(path, mode);

        debug!("Acquired {} lock {}", mode, path.display());
        Ok(Some(LockGuard {
            file,
            path: path.to_path_buf(),
            mode,
            heartbeat: None,
        }))
    }

    /// Remove the lock file if it is older than `stale_after`
    ///
    /// An old lock that nobody holds is leftover residue and is removed
    /// silently. An old lock that is still held belongs to a job that was
    /// killed mid-operation without running its release path (or is
    /// hung); its holder is logged and the lock is broken.
    pub fn reap_if_stale(&self, path: &Path) -> TreeCacheResult<StaleOutcome> {
        match lock_age(path) {
            Some(age) if age >= self.config.stale_after() => {}
            _ => return Ok(StaleOutcome::Fresh),
        }

        // One reaper per lock at a time; the others retry on their next poll
        let guard_path = reap_path(path);
        let reaping = open_lock_file(&guard_path).map_err(|e| lock_err(&guard_path, e))?;
        if !try_lock(&reaping, LockMode::Exclusive).map_err(|e| lock_err(&guard_path, e))? {
            debug!("Another process is reaping {}", path.display());
            return Ok(StaleOutcome::Fresh);
        }

        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StaleOutcome::Fresh),
            Err(e) => return Err(lock_err(path, e)),
        };
        let uncontended = try_lock(&file, LockMode::Exclusive).map_err(|e| lock_err(path, e))?;

        // The path may name a newer lock file by now; only the inode whose
        // age was measured may be removed.
        let meta = file.metadata().map_err(|e| lock_err(path, e))?;
        let age = modified_age(&meta);
        if age < self.config.stale_after() {
            return Ok(StaleOutcome::Fresh);
        }
        match path_identity(path) {
            Ok(current) if current == (meta.dev(), meta.ino()) => {}
            _ => {
                debug!("Stale lock {} was already replaced", path.display());
                return Ok(StaleOutcome::Fresh);
            }
        }

        let outcome = if uncontended {
            debug!(
                "Removing stale lock residue {} ({}s old)",
                path.display(),
                age.as_secs()
            );
            StaleOutcome::Residue
        } else {
            let holder = read_info(path);
            match holder {
                Some(ref info) => warn!(
                    "Breaking stale lock {} ({}s old), held by {}",
                    path.display(),
                    age.as_secs(),
                    info
                ),
                None => warn!(
                    "Breaking stale lock {} ({}s old), holder unknown",
                    path.display(),
                    age.as_secs()
                ),
            }
            StaleOutcome::Broken(holder)
        };

        remove_if_exists(&info_path(path)).map_err(|e| lock_err(path, e))?;
        remove_if_exists(path).map_err(|e| lock_err(path, e))?;
        drop(file);
        drop(reaping);
        Ok(outcome)
    }

    /// Whether someone currently holds the lock (non-blocking check)
    pub fn is_held(path: &Path) -> bool {
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        matches!(try_lock(&file, LockMode::Exclusive), Ok(false))
    }

    fn write_info(&self, path: &Path, mode: LockMode) {
        let info = LockInfo {
            host: self.host.clone(),
            pid: std::process::id(),
            mode,
            acquired_at: Utc::now(),
            job: self.job.clone(),
        };
        let result = serde_json::to_vec_pretty(&info)
            .map_err(io::Error::other)
            .and_then(|bytes| fs::write(info_path(path), bytes));
        if let Err(e) = result {
            warn!("Failed to write lock info for {}: {}", path.display(), e);
        }
    }
}

/// Time since the lock file was last refreshed
pub fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok().map(|meta| modified_age(&meta))
}

fn modified_age(meta: &fs::Metadata) -> Duration {
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

fn lock_err(path: &Path, source: io::Error) -> TreeCacheError {
    TreeCacheError::Lock {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_parent(path: &Path) -> TreeCacheResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TreeCacheError::io(format!("creating lock directory {}", parent.display()), e)
        })?;
    }
    Ok(())
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .mode(0o666)
        .open(path)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn file_identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

fn path_identity(path: &Path) -> io::Result<(u64, u64)> {
    let meta = fs::metadata(path)?;
    Ok((meta.dev(), meta.ino()))
}

fn refresh_if_same(path: &Path, identity: Option<(u64, u64)>) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    if identity.is_some() && file_identity(&file).ok() != identity {
        return Ok(());
    }
    file.set_modified(SystemTime::now())
}

/// Non-blocking lock attempt; `Ok(false)` when another holder conflicts
#[cfg(target_os = "linux")]
fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    // `fcntl_lock` issues F_OFD_SETLK on Linux
    match rustix::fs::fcntl_lock(file, non_blocking(mode)) {
        Ok(()) => Ok(true),
        Err(e) if e == Errno::AGAIN || e == Errno::ACCESS => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    match rustix::fs::flock(file, non_blocking(mode)) {
        Ok(()) => Ok(true),
        Err(e) if e == Errno::WOULDBLOCK => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn non_blocking(mode: LockMode) -> FlockOperation {
    match mode {
        LockMode::Shared => FlockOperation::NonBlockingLockShared,
        LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn manager(stale_after_secs: u64) -> LockManager {
        LockManager::new(
            LockConfig {
                timeout_secs: 1,
                stale_after_secs,
                poll_interval_ms: 20,
                heartbeat: true,
            },
            JobIdentity::default(),
        )
    }

    fn age_file(path: &Path, secs: u64) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);

        let a = locks.try_acquire(&path, LockMode::Shared).unwrap();
        let b = locks.try_acquire(&path, LockMode::Shared).unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(locks.try_acquire(&path, LockMode::Exclusive).unwrap().is_none());
    }

    #[test]
    fn exclusive_excludes_everyone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);

        let guard = locks.try_acquire(&path, LockMode::Exclusive).unwrap().unwrap();
        assert!(LockManager::is_held(&path));
        assert!(locks.try_acquire(&path, LockMode::Shared).unwrap().is_none());

        guard.release();
        assert!(!LockManager::is_held(&path));
        assert!(locks.try_acquire(&path, LockMode::Shared).unwrap().is_some());
    }

    #[test]
    fn acquisition_writes_side_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let _guard = manager(600)
            .try_acquire(&path, LockMode::Exclusive)
            .unwrap()
            .unwrap();

        let info = read_info(&path).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.mode, LockMode::Exclusive);
        assert_eq!(info.host, hostname());
    }

    #[tokio::test]
    async fn acquire_times_out_when_contended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);

        let _held = locks.try_acquire(&path, LockMode::Exclusive).unwrap().unwrap();
        let err = locks
            .acquire_within(&path, LockMode::Shared, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeCacheError::LockTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);

        let held = locks.try_acquire(&path, LockMode::Exclusive).unwrap().unwrap();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            held.release();
        });

        let (guard, _) = locks.acquire(&path, LockMode::Exclusive).await.unwrap();
        assert_eq!(guard.mode(), LockMode::Exclusive);
        releaser.await.unwrap();
    }

    #[test]
    fn fresh_lock_is_not_reaped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        File::create(&path).unwrap();

        assert_eq!(manager(600).reap_if_stale(&path).unwrap(), StaleOutcome::Fresh);
        assert!(path.exists());
    }

    #[test]
    fn old_uncontended_lock_is_residue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        File::create(&path).unwrap();
        age_file(&path, 15 * 60);

        assert_eq!(
            manager(600).reap_if_stale(&path).unwrap(),
            StaleOutcome::Residue
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn old_contended_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let holder = LockManager::new(
            LockConfig {
                heartbeat: false,
                ..manager(600).config().clone()
            },
            JobIdentity {
                job_id: Some("777".to_string()),
                ..JobIdentity::default()
            },
        );

        // Simulates a killed job: the lock is still held but never refreshed
        let (_zombie, _) = holder.acquire(&path, LockMode::Exclusive).await.unwrap();
        age_file(&path, 15 * 60);

        let locks = manager(600);
        let (guard, outcome) = locks.acquire(&path, LockMode::Exclusive).await.unwrap();
        match outcome {
            StaleOutcome::Broken(Some(info)) => assert_eq!(info.job.job_id.as_deref(), Some("777")),
            other => panic!("expected broken lock, got {:?}", other),
        }
        assert_eq!(guard.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn racing_reapers_never_share_an_exclusive_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);
        let mut doubled = 0;

        for _ in 0..200 {
            File::create(&path).unwrap();
            age_file(&path, 15 * 60);
            let start = Barrier::new(2);
            let held = Barrier::new(2);
            let holders = AtomicUsize::new(0);

            std::thread::scope(|s| {
                for _ in 0..2 {
                    s.spawn(|| {
                        start.wait();
                        locks.reap_if_stale(&path).unwrap();
                        let guard = locks.try_acquire(&path, LockMode::Exclusive).unwrap();
                        if guard.is_some() {
                            holders.fetch_add(1, Ordering::SeqCst);
                        }
                        held.wait();
                        drop(guard);
                    });
                }
            });

            if holders.load(Ordering::SeqCst) > 1 {
                doubled += 1;
            }
        }
        assert_eq!(doubled, 0);
    }

    #[test]
    fn reaping_is_skipped_while_another_reaper_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);
        File::create(&path).unwrap();
        age_file(&path, 15 * 60);

        let other = open_lock_file(&reap_path(&path)).unwrap();
        assert!(try_lock(&other, LockMode::Exclusive).unwrap());
        assert_eq!(locks.reap_if_stale(&path).unwrap(), StaleOutcome::Fresh);
        assert!(path.exists());

        drop(other);
        assert_eq!(locks.reap_if_stale(&path).unwrap(), StaleOutcome::Residue);
        assert!(!path.exists());
    }

    #[test]
    fn removed_lock_file_is_not_trusted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let locks = manager(600);

        let guard = locks.try_acquire(&path, LockMode::Exclusive).unwrap().unwrap();
        guard.remove_files().unwrap();
        assert!(!path.exists());
        assert!(!info_path(&path).exists());
        assert!(locks.try_acquire(&path, LockMode::Exclusive).unwrap().is_some());
    }

    #[test]
    fn info_path_appends_suffix() {
        assert_eq!(
            info_path(Path::new("/c/haf/k.lock")),
            PathBuf::from("/c/haf/k.lock.info")
        );
    }
}
