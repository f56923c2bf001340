//! Per-host event journal
//!
//! Appends one JSON line per cache-mutating event to
//! `$XDG_STATE_HOME/treecache/events.log`. Journal failures are logged and
//! otherwise ignored; they never fail a cache operation.

use crate::config::{schema::Config, ConfigManager};
use crate::host::{hostname, JobIdentity};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Events written to the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PutPublished,
    PutLocalOnly,
    EvictRemoved,
    LockBroken,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PutPublished => "put.published",
            Self::PutLocalOnly => "put.local_only",
            Self::EvictRemoved => "evict.removed",
            Self::LockBroken => "lock.broken",
        }
    }
}

/// Append-only JSON lines journal
#[derive(Debug, Clone)]
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
    host: String,
    job: JobIdentity,
}

impl AuditLog {
    /// Create a journal from config at the default state path
    pub fn new(config: &Config, job: JobIdentity) -> Self {
        Self::with_path(ConfigManager::audit_log_path(), config.general.audit_log, job)
    }

    pub fn with_path(path: PathBuf, enabled: bool, job: JobIdentity) -> Self {
        Self {
            enabled,
            path,
            host: hostname(),
            job,
        }
    }

    /// A journal that records nothing
    pub fn disabled() -> Self {
        Self::with_path(PathBuf::new(), false, JobIdentity::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event with its details
    pub async fn log(&self, event: Event, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event.as_str(),
            "host": self.host,
            "job": self.job,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize journal event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event journal {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
