//! Last-access index shared by every host using a tier
//!
//! The index is a small text file, one `<unix-seconds> <type>/<key>` line
//! per entry, oldest first. Every update is a remove-then-append rewrite
//! performed under the index lock and published with a rename, so readers
//! never see a torn file.

use crate::error::{TreeCacheError, TreeCacheResult};
use crate::store::lock::{LockManager, LockMode};
use crate::store::topology::{CachePaths, EntryId};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// One index line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruRecord {
    /// Last access, seconds since the unix epoch
    pub last_access: i64,
    pub id: EntryId,
}

impl LruRecord {
    fn parse(line: &str) -> Option<Self> {
        let (ts, entry) = line.trim().split_once(' ')?;
        Some(Self {
            last_access: ts.parse().ok()?,
            id: entry.trim().parse().ok()?,
        })
    }

    fn to_line(&self) -> String {
        format!("{} {}\n", self.last_access, self.id)
    }
}

/// LRU index of one tier root
#[derive(Debug, Clone)]
pub struct LruIndex {
    paths: CachePaths,
    locks: LockManager,
}

impl LruIndex {
    pub fn new(paths: CachePaths, locks: LockManager) -> Self {
        Self { paths, locks }
    }

    /// Read all records without taking the index lock
    pub fn read(&self) -> TreeCacheResult<Vec<LruRecord>> {
        read_records(&self.paths.index())
    }

    /// Last-access timestamps keyed by entry
    pub fn access_times(&self) -> TreeCacheResult<HashMap<EntryId, i64>> {
        Ok(self
            .read()?
            .into_iter()
            .map(|r| (r.id, r.last_access))
            .collect())
    }

    /// Record an access to `id` now
    pub async fn touch(&self, id: &EntryId) -> TreeCacheResult<()> {
        let (guard, _) = self
            .locks
            .acquire(&self.paths.index_lock(), LockMode::Exclusive)
            .await?;

        let mut records = self.read()?;
        records.retain(|r| &r.id != id);
        records.push(LruRecord {
            last_access: Utc::now().timestamp(),
            id: id.clone(),
        });
        self.rewrite(&records)?;

        guard.release();
        debug!("Touched {} in {}", id, self.paths.index().display());
        Ok(())
    }

    /// Drop records for removed entries
    ///
    /// A record is only dropped if it is not newer than `seen`, the
    /// timestamp observed when the entry was chosen for removal; an entry
    /// republished in the meantime keeps its fresh record.
    pub async fn forget(&self, removed: &HashMap<EntryId, i64>) -> TreeCacheResult<()> {
        if removed.is_empty() {
            return Ok(());
        }
        let (guard, _) = self
            .locks
            .acquire(&self.paths.index_lock(), LockMode::Exclusive)
            .await?;

        let mut records = self.read()?;
        records.retain(|r| match removed.get(&r.id) {
            Some(&seen) => r.last_access > seen,
            None => true,
        });
        self.rewrite(&records)?;

        guard.release();
        Ok(())
    }

    fn rewrite(&self, records: &[LruRecord]) -> TreeCacheResult<()> {
        let path = self.paths.index();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TreeCacheError::io(format!("creating {}", parent.display()), e))?;
        }

        let mut sorted = records.to_vec();
        sorted.sort_by_key(|r| r.last_access);
        let content: String = sorted.iter().map(LruRecord::to_line).collect();

        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, content)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                TreeCacheError::io(format!("rewriting index {}", path.display()), e)
            })
    }
}

fn read_records(path: &Path) -> TreeCacheResult<Vec<LruRecord>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(TreeCacheError::io(
                format!("reading index {}", path.display()),
                e,
            ))
        }
    };

    let mut records: Vec<LruRecord> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let record = LruRecord::parse(line);
            if record.is_none() {
                debug!("Ignoring malformed index line: {:?}", line);
            }
            record
        })
        .collect();
    records.sort_by_key(|r| r.last_access);
    Ok(records)
}
