//! Two-tier cache operations
//!
//! `Cache` owns the resolved topology and implements `get`, `put`,
//! `cleanup`, `list` and `status` on top of the lock manager, the archive
//! engine, the payload normalizer and the LRU index.

use crate::audit::{AuditLog, Event};
use crate::config::schema::{BackgroundEviction, Config, PayloadKind};
use crate::error::{TreeCacheError, TreeCacheResult};
use crate::host::{self, hostname, JobIdentity};
use crate::store::archive;
use crate::store::entry::{CacheSizeStatus, EntryMetadata, EntrySummary, METADATA_VERSION};
use crate::store::evict::{scan_tier, CleanupReport, CleanupRequest, Evictor};
use crate::store::lock::{LockManager, LockMode, StaleOutcome};
use crate::store::lru::LruIndex;
use crate::store::normalize;
use crate::store::topology::{CachePaths, EntryId, StorageTopology, Tier};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// Result of `get`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GetOutcome {
    Hit { tier: Tier },
    Miss,
}

/// Result of `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PutOutcome {
    /// A new archive was published to the shared store
    Published { archive_bytes: u64 },
    /// Another producer already published this entry
    AlreadyPresent,
    /// The shared store is unreachable; the archive was kept locally
    LocalOnly { archive_bytes: u64 },
}

/// Usage of one tier
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub tier: Tier,
    pub root: PathBuf,
    pub entries: usize,
    pub bytes: u64,
    pub limit_bytes: Option<u64>,
    pub percent: f64,
    pub status: CacheSizeStatus,
    /// Temporary files left by interrupted producers
    pub leftovers: usize,
}

/// Output of `status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub host: String,
    pub role: &'static str,
    pub topology: String,
    pub fast_host: bool,
    pub tiers: Vec<TierStatus>,
}

/// The cache as seen from this host
#[derive(Debug, Clone)]
pub struct Cache {
    config: Config,
    topology: StorageTopology,
    locks: LockManager,
    audit: AuditLog,
    job: JobIdentity,
    /// File the configuration was loaded from, handed to cleanup children
    config_path: Option<PathBuf>,
}

impl Cache {
    pub fn new(config: Config, topology: StorageTopology, job: JobIdentity) -> Self {
        let locks = LockManager::new(config.lock.clone(), job.clone());
        let audit = AuditLog::new(&config, job.clone());
        Self {
            config,
            topology,
            locks,
            audit,
            job,
            config_path: None,
        }
    }

    /// Record where the configuration came from
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Replace the event journal
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn topology(&self) -> &StorageTopology {
        &self.topology
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extract an entry into `dest`
    ///
    /// The local accelerator is preferred over the shared store. On a miss
    /// nothing is touched, `dest` included.
    pub async fn get(&self, id: &EntryId, dest: &Path) -> TreeCacheResult<GetOutcome> {
        let Some((tier, paths)) = self.locate(id) else {
            debug!("Miss for {}", id);
            return Ok(GetOutcome::Miss);
        };

        let lock = paths.lock(id);
        let (guard, stale) = self.locks.acquire(&lock, LockMode::Shared).await?;
        self.note_stale(&lock, stale).await;

        // Evicted between lookup and lock
        if !paths.archive(id).exists() {
            debug!("{} disappeared before it could be locked", id);
            return Ok(GetOutcome::Miss);
        }

        self.extract(&paths, id, dest).await?;
        let backfilled = tier == Tier::Shared && self.backfill(id, &paths).await;
        guard.release();

        self.touch(&paths, id).await;
        if backfilled {
            if let Some(local) = self.topology.local() {
                self.touch(&local, id).await;
            }
        }

        info!("Hit for {} from {} tier into {}", id, tier, dest.display());
        Ok(GetOutcome::Hit { tier })
    }

    /// Publish `source` as the entry `id`
    pub async fn put(&self, id: &EntryId, source: &Path) -> TreeCacheResult<PutOutcome> {
        if !source.is_dir() {
            return Err(TreeCacheError::SourceMissing(source.to_path_buf()));
        }

        let Some(shared) = self.topology.shared() else {
            return self.put_local_only(id, source).await;
        };

        if shared.archive(id).exists() {
            info!("{} already present in the shared store", id);
            let lock = shared.lock(id);
            let (guard, stale) = self.locks.acquire(&lock, LockMode::Shared).await?;
            self.note_stale(&lock, stale).await;
            let backfilled = shared.archive(id).exists() && self.backfill(id, &shared).await;
            guard.release();
            self.touch_after_put(&shared, id, backfilled).await;
            return Ok(PutOutcome::AlreadyPresent);
        }

        let Some((metadata, backfilled)) = self.publish_entry(&shared, id, source, true).await?
        else {
            info!("{} was published by another producer", id);
            self.touch(&shared, id).await;
            return Ok(PutOutcome::AlreadyPresent);
        };

        self.touch_after_put(&shared, id, backfilled).await;
        self.audit
            .log(Event::PutPublished, &serde_json::to_value(&metadata)?)
            .await;
        info!(
            "Published {} ({} bytes) to {}",
            id,
            metadata.archive_bytes,
            shared.root().display()
        );

        self.maybe_trigger_eviction(Tier::Shared, &shared).await;
        Ok(PutOutcome::Published {
            archive_bytes: metadata.archive_bytes,
        })
    }

    async fn put_local_only(&self, id: &EntryId, source: &Path) -> TreeCacheResult<PutOutcome> {
        let local = self
            .topology
            .local()
            .ok_or_else(|| TreeCacheError::SharedUnavailable(self.config.storage.shared_root.clone()))?;
        warn!(
            "Shared store {} unreachable, keeping {} in the local accelerator only",
            self.config.storage.shared_root.display(),
            id
        );

        let Some((metadata, _)) = self.publish_entry(&local, id, source, false).await? else {
            self.touch(&local, id).await;
            return Ok(PutOutcome::AlreadyPresent);
        };

        self.touch(&local, id).await;
        self.audit
            .log(Event::PutLocalOnly, &serde_json::to_value(&metadata)?)
            .await;
        self.maybe_trigger_eviction(Tier::Local, &local).await;
        Ok(PutOutcome::LocalOnly {
            archive_bytes: metadata.archive_bytes,
        })
    }

    /// Pack and publish under the entry's exclusive lock
    ///
    /// Returns `None` when the entry already exists, either before packing
    /// started or after it finished. The second flag reports whether the
    /// local accelerator was backfilled.
    async fn publish_entry(
        &self,
        paths: &CachePaths,
        id: &EntryId,
        source: &Path,
        backfill: bool,
    ) -> TreeCacheResult<Option<(EntryMetadata, bool)>> {
        let lock = paths.lock(id);
        let (guard, stale) = self.locks.acquire(&lock, LockMode::Exclusive).await?;
        self.note_stale(&lock, stale).await;

        let archive_path = paths.archive(id);
        if archive_path.exists() {
            return Ok(None);
        }

        let settings = self.config.type_config(&id.cache_type);
        let level = self.config.storage.compression_level;
        let partial = paths.partial(id);

        let src = source.to_path_buf();
        let out = partial.clone();
        let payload = settings.payload;
        let packed = tokio::task::spawn_blocking(move || {
            if payload == PayloadKind::Postgres {
                normalize::prepare_for_archive(&src)?;
            }
            archive::pack(&src, &out, level)
        })
        .await?;

        let stats = match packed {
            Ok(stats) => stats,
            Err(e) => {
                discard(&partial);
                return Err(e);
            }
        };

        if archive_path.exists() {
            debug!("{} appeared while packing, discarding {}", id, partial.display());
            discard(&partial);
            return Ok(None);
        }
        if let Err(e) = archive::publish(&partial, &archive_path) {
            discard(&partial);
            return Err(e);
        }

        let metadata = EntryMetadata {
            version: METADATA_VERSION,
            cache_type: id.cache_type.clone(),
            key: id.key.clone(),
            created_at: Utc::now(),
            archive_bytes: stats.archive_bytes,
            source_bytes: stats.source_bytes,
            file_count: stats.file_count,
            sha256: stats.sha256,
            payload,
            host: hostname(),
            job: self.job.clone(),
        };
        if let Err(e) = metadata.store(&paths.metadata(id)) {
            warn!("Published {} without metadata: {}", id, e);
        }

        let backfilled = backfill && self.backfill(id, paths).await;
        guard.release();
        Ok(Some((metadata, backfilled)))
    }

    /// Verify, extract and restore an archive into `dest`
    async fn extract(&self, paths: &CachePaths, id: &EntryId, dest: &Path) -> TreeCacheResult<()> {
        let expected = if self.config.storage.verify_checksum {
            match EntryMetadata::load(paths, id)? {
                Some(metadata) => Some(metadata.sha256),
                None => {
                    warn!("No metadata for {}, skipping checksum verification", id);
                    None
                }
            }
        } else {
            None
        };

        let archive_path = paths.archive(id);
        let target = dest.to_path_buf();
        let settings = self.config.type_config(&id.cache_type);
        tokio::task::spawn_blocking(move || {
            if let Some(sum) = expected {
                archive::verify(&archive_path, &sum)?;
            }
            match settings.payload {
                // Restored while staged, so an unusable payload never reaches `dest`
                PayloadKind::Postgres => archive::unpack_with(&archive_path, &target, |staged| {
                    normalize::restore_after_extract(staged, &settings).map(|_| ())
                }),
                PayloadKind::Plain => archive::unpack(&archive_path, &target),
            }
        })
        .await?
    }

    /// Copy a shared archive into the local accelerator if it is absent
    ///
    /// Best-effort: failures are logged and reported as `false`. The
    /// caller holds a lock on the shared entry.
    async fn backfill(&self, id: &EntryId, shared: &CachePaths) -> bool {
        let Some(local) = self.topology.local() else {
            return false;
        };
        if local.archive(id).exists() {
            return false;
        }
        match self.copy_to_local(id, shared, &local).await {
            Ok(copied) => copied,
            Err(e) => {
                warn!("Could not backfill {} into {}: {}", id, local.root().display(), e);
                false
            }
        }
    }

    async fn copy_to_local(
        &self,
        id: &EntryId,
        shared: &CachePaths,
        local: &CachePaths,
    ) -> TreeCacheResult<bool> {
        let Some(guard) = self.locks.try_acquire(&local.lock(id), LockMode::Exclusive)? else {
            debug!("Local copy of {} is being written by someone else", id);
            return Ok(false);
        };
        let target = local.archive(id);
        if target.exists() {
            return Ok(false);
        }

        let from = shared.archive(id);
        let partial = local.partial(id);
        let meta_from = shared.metadata(id);
        let meta_to = local.metadata(id);
        let copied = tokio::task::spawn_blocking(move || {
            let bytes = archive::copy_archive(&from, &partial)
                .and_then(|bytes| archive::publish(&partial, &target).map(|_| bytes));
            if bytes.is_err() {
                discard(&partial);
            }
            if bytes.is_ok() && meta_from.exists() {
                if let Err(e) = std::fs::copy(&meta_from, &meta_to) {
                    debug!("Could not copy metadata to {}: {}", meta_to.display(), e);
                }
            }
            bytes
        })
        .await??;

        guard.release();
        debug!("Backfilled {} ({} bytes) into the local accelerator", id, copied);
        Ok(true)
    }

    /// Run one eviction pass over a tier
    pub async fn cleanup(
        &self,
        tier: Tier,
        request: CleanupRequest,
    ) -> TreeCacheResult<CleanupReport> {
        let paths = self.tier_paths(tier)?;
        let report = Evictor::new(paths.clone(), self.locks.clone())
            .cleanup(request)
            .await?;

        for id in &report.removed {
            self.audit
                .log(
                    Event::EvictRemoved,
                    &serde_json::json!({ "entry": id.to_string(), "root": paths.root() }),
                )
                .await;
        }
        for broken in &report.broken_locks {
            self.note_stale(
                &paths.lock(&broken.id),
                StaleOutcome::Broken(broken.holder.clone()),
            )
            .await;
        }
        for id in &report.skipped_locked {
            warn!("Skipped eviction of {}: entry is locked", id);
        }
        Ok(report)
    }

    /// Eviction limits from configuration
    pub fn default_cleanup_request(&self) -> CleanupRequest {
        CleanupRequest {
            cache_type: None,
            max_size_bytes: self.config.eviction.size_ceiling(),
            max_age: self.config.eviction.max_age(),
        }
    }

    /// Entries stored in a tier
    pub async fn list(
        &self,
        tier: Tier,
        cache_type: Option<&str>,
    ) -> TreeCacheResult<Vec<EntrySummary>> {
        let paths = self.tier_paths(tier)?;
        let access = LruIndex::new(paths.clone(), self.locks.clone()).access_times()?;
        let filter = cache_type.map(str::to_string);
        let scan_paths = paths.clone();
        let scan =
            tokio::task::spawn_blocking(move || scan_tier(&scan_paths, filter.as_deref())).await??;

        let entries = scan
            .archives
            .into_iter()
            .map(|archive| {
                let last = access.get(&archive.id).copied().unwrap_or(archive.modified);
                let metadata = EntryMetadata::load(&paths, &archive.id).unwrap_or_else(|e| {
                    debug!("Unreadable metadata for {}: {}", archive.id, e);
                    None
                });
                EntrySummary {
                    in_use: LockManager::is_held(&paths.lock(&archive.id)),
                    last_access: DateTime::from_timestamp(last, 0),
                    tier,
                    archive_bytes: archive.bytes,
                    metadata,
                    id: archive.id,
                }
            })
            .collect();
        Ok(entries)
    }

    /// Usage of every tier available on this host
    pub async fn status(&self) -> TreeCacheResult<StatusReport> {
        let mut tiers = Vec::new();
        for (tier, paths) in [
            (Tier::Shared, self.topology.shared()),
            (Tier::Local, self.topology.local()),
        ] {
            let Some(paths) = paths else { continue };
            tiers.push(self.tier_status(tier, paths).await?);
        }

        Ok(StatusReport {
            host: hostname(),
            role: self.topology.role_name(),
            topology: self.topology.to_string(),
            fast_host: self.is_fast_host(),
            tiers,
        })
    }

    async fn tier_status(&self, tier: Tier, paths: CachePaths) -> TreeCacheResult<TierStatus> {
        let root = paths.root().to_path_buf();
        let scan = tokio::task::spawn_blocking(move || scan_tier(&paths, None)).await??;
        let bytes = scan.total_bytes();
        let limit = self.config.eviction.size_ceiling();
        let trigger = self.config.eviction.trigger_percent;

        Ok(TierStatus {
            tier,
            root,
            entries: scan.archives.len(),
            bytes,
            limit_bytes: limit,
            percent: limit.map_or(0.0, |l| CacheSizeStatus::percentage(bytes, l)),
            status: limit.map_or(CacheSizeStatus::Ok, |l| {
                CacheSizeStatus::from_usage(bytes, l, trigger)
            }),
            leftovers: scan.leftovers.len(),
        })
    }

    /// Whether this host should receive expensive jobs
    pub fn is_fast_host(&self) -> bool {
        host::is_fast_host(&self.config.host, &self.topology)
    }

    fn locate(&self, id: &EntryId) -> Option<(Tier, CachePaths)> {
        [Tier::Local, Tier::Shared].into_iter().find_map(|tier| {
            self.topology
                .tier(tier)
                .filter(|paths| paths.archive(id).exists())
                .map(|paths| (tier, paths))
        })
    }

    fn tier_paths(&self, tier: Tier) -> TreeCacheResult<CachePaths> {
        match (self.topology.tier(tier), tier) {
            (Some(paths), _) => Ok(paths),
            // The coordinator's accelerator is the shared store itself
            (None, Tier::Local) if self.topology.is_coordinator() => self
                .topology
                .shared()
                .ok_or_else(|| TreeCacheError::SharedUnavailable(self.config.storage.shared_root.clone())),
            (None, _) => Err(TreeCacheError::SharedUnavailable(
                self.config.storage.shared_root.clone(),
            )),
        }
    }

    async fn touch(&self, paths: &CachePaths, id: &EntryId) {
        let index = LruIndex::new(paths.clone(), self.locks.clone());
        if let Err(e) = index.touch(id).await {
            warn!(
                "Could not refresh last access of {} in {}: {}",
                id,
                paths.index().display(),
                e
            );
        }
    }

    async fn touch_after_put(&self, shared: &CachePaths, id: &EntryId, backfilled: bool) {
        self.touch(shared, id).await;
        if backfilled {
            if let Some(local) = self.topology.local() {
                self.touch(&local, id).await;
            }
        }
    }

    async fn note_stale(&self, lock: &Path, outcome: StaleOutcome) {
        if let StaleOutcome::Broken(holder) = outcome {
            self.audit
                .log(
                    Event::LockBroken,
                    &serde_json::json!({ "lock": lock, "holder": holder }),
                )
                .await;
        }
    }

    /// Start background eviction when a tier is close to its ceiling
    ///
    /// Never awaited and never fails the calling `put`.
    async fn maybe_trigger_eviction(&self, tier: Tier, paths: &CachePaths) {
        let Some(limit) = self.config.eviction.size_ceiling() else {
            return;
        };
        if self.config.eviction.background == BackgroundEviction::Off {
            return;
        }

        let scan_paths = paths.clone();
        let usage = match tokio::task::spawn_blocking(move || scan_tier(&scan_paths, None)).await {
            Ok(Ok(scan)) => scan.total_bytes(),
            Ok(Err(e)) => {
                warn!("Could not measure {}: {}", paths.root().display(), e);
                return;
            }
            Err(e) => {
                warn!("Could not measure {}: {}", paths.root().display(), e);
                return;
            }
        };

        let percent = CacheSizeStatus::percentage(usage, limit);
        if percent <= f64::from(self.config.eviction.trigger_percent) {
            return;
        }
        info!(
            "{} tier at {:.0}% of its ceiling, starting background eviction",
            tier, percent
        );

        match self.config.eviction.background {
            BackgroundEviction::Task => {
                let cache = self.clone();
                let request = self.default_cleanup_request();
                tokio::spawn(async move {
                    if let Err(e) = cache.cleanup(tier, request).await {
                        warn!("Background eviction of {} tier failed: {}", tier, e);
                    }
                });
            }
            BackgroundEviction::Process => {
                if let Err(e) = self.spawn_cleanup_process(tier) {
                    warn!("Could not start background eviction: {}", e);
                }
            }
            BackgroundEviction::Off => {}
        }
    }

    /// Detached `treecache cleanup` so the calling job can exit right away
    fn spawn_cleanup_process(&self, tier: Tier) -> std::io::Result<()> {
        let child = self.cleanup_command(tier)?.spawn()?;
        debug!("Spawned background eviction process {:?}", child.id());
        Ok(())
    }

    /// Command line for a cleanup child applying this process's limits
    fn cleanup_command(&self, tier: Tier) -> std::io::Result<tokio::process::Command> {
        let request = self.default_cleanup_request();
        let mut cmd = tokio::process::Command::new(std::env::current_exe()?);
        cmd.arg("cleanup");
        if let Some(ref path) = self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("--shared-root")
            .arg(&self.config.storage.shared_root)
            .arg("--local-root")
            .arg(&self.config.storage.local_root)
            .arg("--max-size-bytes")
            .arg(request.max_size_bytes.unwrap_or(0).to_string());
        if let Some(max_age) = request.max_age {
            cmd.arg("--max-age-secs").arg(max_age.as_secs().to_string());
        }
        if tier == Tier::Local {
            cmd.arg("--local");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .process_group(0);
        Ok(cmd)
    }
}

fn discard(partial: &Path) {
    if let Err(e) = std::fs::remove_file(partial) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", partial.display(), e);
        }
    }
}
