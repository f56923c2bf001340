//! Error types for treecache
//!
//! All modules use `TreeCacheResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for treecache operations
pub type TreeCacheResult<T> = Result<T, TreeCacheError>;

/// All errors that can occur in treecache
#[derive(Error, Debug)]
pub enum TreeCacheError {
    // Input errors
    #[error("Invalid cache {what} '{value}': {reason}")]
    InvalidName {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Source directory not found: {0}")]
    SourceMissing(PathBuf),

    // Locking errors
    #[error("Timed out after {}s waiting for lock {path}", timeout.as_secs())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Lock operation failed on {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Storage errors
    #[error("Shared store unavailable: {0}")]
    SharedUnavailable(PathBuf),

    #[error("Archive error for {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Payload restoration failed for {path}: {reason}")]
    PayloadRestore { path: PathBuf, reason: String },

    #[error("Permission denied preparing {path} for archiving: {reason}")]
    PayloadPrepare { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl TreeCacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an archive error
    pub fn archive(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Archive {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Whether the caller should treat this failure as a cache miss
    pub fn is_miss_equivalent(&self) -> bool {
        matches!(
            self,
            Self::PayloadRestore { .. } | Self::ChecksumMismatch { .. } | Self::Archive { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockTimeout { .. } => {
                Some("Another job holds this entry; retry the job or raise lock.timeout_secs")
            }
            Self::PayloadRestore { .. } | Self::ChecksumMismatch { .. } => {
                Some("Treat as a cache miss and regenerate the artifact from scratch")
            }
            Self::SourceMissing(_) => Some("Run the artifact producer before calling put"),
            Self::SharedUnavailable(_) => Some("Check that the shared cache mount is present"),
            _ => None,
        }
    }
}
