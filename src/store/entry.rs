//! Cache entry metadata records and usage summaries

use crate::config::schema::PayloadKind;
use crate::error::{TreeCacheError, TreeCacheResult};
use crate::host::JobIdentity;
use crate::store::topology::{CachePaths, EntryId, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Current metadata format version
pub const METADATA_VERSION: u32 = 1;

/// Sidecar record stored next to every published archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub version: u32,
    pub cache_type: String,
    pub key: String,
    pub created_at: DateTime<Utc>,
    /// Compressed archive size in bytes
    pub archive_bytes: u64,
    /// Total size of the regular files that were archived
    pub source_bytes: u64,
    /// Number of filesystem entries in the archive
    pub file_count: u64,
    /// SHA-256 of the compressed archive (hex)
    pub sha256: String,
    pub payload: PayloadKind,
    pub host: String,
    #[serde(flatten)]
    pub job: JobIdentity,
}

impl EntryMetadata {
    /// Load the sidecar for an entry; `None` if it does not exist
    pub fn load(paths: &CachePaths, id: &EntryId) -> TreeCacheResult<Option<Self>> {
        let path = paths.metadata(id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TreeCacheError::io(
                format!("reading metadata {}", path.display()),
                e,
            )),
        }
    }

    /// Write the sidecar via a temporary file so readers never see half a record
    pub fn store(&self, path: &Path) -> TreeCacheResult<()> {
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp = std::path::PathBuf::from(tmp);

        let content = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, content)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                TreeCacheError::io(format!("writing metadata {}", path.display()), e)
            })
    }
}

/// One entry as seen by `list`
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub id: EntryId,
    pub tier: Tier,
    pub archive_bytes: u64,
    pub last_access: Option<DateTime<Utc>>,
    pub in_use: bool,
    pub metadata: Option<EntryMetadata>,
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Cache size status relative to configured limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSizeStatus {
    /// Under the eviction trigger
    Ok,
    /// Between the eviction trigger and the limit
    Warning,
    /// At or over the limit
    Exceeded,
}

impl CacheSizeStatus {
    /// Determine status based on current size, limit and trigger percentage
    pub fn from_usage(current_bytes: u64, limit_bytes: u64, trigger_percent: u8) -> Self {
        if limit_bytes == 0 {
            return Self::Ok;
        }
        let percent = Self::percentage(current_bytes, limit_bytes);
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= f64::from(trigger_percent) {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Get percentage of limit used
    pub fn percentage(current_bytes: u64, limit_bytes: u64) -> f64 {
        if limit_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / limit_bytes as f64) * 100.0
    }
}
