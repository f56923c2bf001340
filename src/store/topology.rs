//! Storage topology and path resolution
//!
//! Maps a (cache type, cache key) pair onto files in the shared store and
//! the local accelerator, and decides once per process whether this host
//! *is* the shared store or a remote client of it.

use crate::config::schema::{HostRole, StorageConfig};
use crate::error::{TreeCacheError, TreeCacheResult};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Suffix of a published archive
pub const ARCHIVE_SUFFIX: &str = ".tar.zst";
/// Suffix of an in-progress archive
pub const PARTIAL_SUFFIX: &str = ".partial";

const MAX_NAME_LEN: usize = 200;

/// Identifies one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId {
    pub cache_type: String,
    pub key: String,
}

impl EntryId {
    /// Build a validated entry id
    pub fn new(cache_type: impl Into<String>, key: impl Into<String>) -> TreeCacheResult<Self> {
        let cache_type = cache_type.into();
        let key = key.into();
        validate_name("type", &cache_type)?;
        validate_name("key", &key)?;
        Ok(Self { cache_type, key })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cache_type, self.key)
    }
}

impl FromStr for EntryId {
    type Err = TreeCacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((cache_type, key)) => Self::new(cache_type, key),
            None => Err(TreeCacheError::InvalidName {
                what: "entry",
                value: s.to_string(),
                reason: "expected <type>/<key>",
            }),
        }
    }
}

/// Validate a cache type or key as a single safe path component
pub fn validate_name(what: &'static str, value: &str) -> TreeCacheResult<()> {
    let invalid = |reason| {
        Err(TreeCacheError::InvalidName {
            what,
            value: value.to_string(),
            reason,
        })
    };

    if value.is_empty() {
        return invalid("must not be empty");
    }
    if value.len() > MAX_NAME_LEN {
        return invalid("longer than 200 bytes");
    }
    if value.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        return invalid("only [A-Za-z0-9._-] allowed");
    }
    Ok(())
}

/// Which copy of an entry an operation touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Shared,
    Local,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// File locations under one tier root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn type_dir(&self, cache_type: &str) -> PathBuf {
        self.root.join(cache_type)
    }

    pub fn archive(&self, id: &EntryId) -> PathBuf {
        self.entry_file(id, ARCHIVE_SUFFIX)
    }

    pub fn metadata(&self, id: &EntryId) -> PathBuf {
        self.entry_file(id, ".meta.json")
    }

    pub fn lock(&self, id: &EntryId) -> PathBuf {
        self.entry_file(id, ".lock")
    }

    /// Fresh temporary name for an archive being written
    pub fn partial(&self, id: &EntryId) -> PathBuf {
        self.entry_file(id, &format!(".{}{}", uuid::Uuid::new_v4().simple(), PARTIAL_SUFFIX))
    }

    pub fn index(&self) -> PathBuf {
        self.root.join(".lru_index")
    }

    pub fn index_lock(&self) -> PathBuf {
        self.root.join(".lru_index.lock")
    }

    fn entry_file(&self, id: &EntryId, suffix: &str) -> PathBuf {
        self.type_dir(&id.cache_type)
            .join(format!("{}{}", id.key, suffix))
    }
}

/// Extract the cache key from a published archive file name
pub fn key_from_archive_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(ARCHIVE_SUFFIX)
        .filter(|key| validate_name("key", key).is_ok())
}

/// Where the shared store lives relative to this host
///
/// Resolved once at startup and passed to everything that needs paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageTopology {
    /// The shared store is local storage on this host; the accelerator
    /// and the shared entry are the same file
    Coordinator { root: PathBuf },
    /// The shared store is a reachable network mount
    Client { shared: PathBuf, local: PathBuf },
    /// The shared store is unreachable; only the accelerator is usable
    LocalOnly { local: PathBuf },
}

impl StorageTopology {
    /// Inspect the filesystem and classify this host
    pub fn resolve(storage: &StorageConfig) -> Self {
        let shared = &storage.shared_root;
        let local = &storage.local_root;

        let topology = match storage.role {
            HostRole::Coordinator => Self::Coordinator {
                root: shared.clone(),
            },
            HostRole::Client => Self::client(shared, local),
            HostRole::Auto if serves_shared_locally(shared, local) => Self::Coordinator {
                root: shared.clone(),
            },
            HostRole::Auto => Self::client(shared, local),
        };

        debug!("Resolved storage topology: {}", topology);
        topology
    }

    fn client(shared: &Path, local: &Path) -> Self {
        if is_reachable(shared) {
            Self::Client {
                shared: shared.to_path_buf(),
                local: local.to_path_buf(),
            }
        } else {
            warn!(
                "Shared store {} unreachable, using local accelerator only",
                shared.display()
            );
            Self::LocalOnly {
                local: local.to_path_buf(),
            }
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, Self::Coordinator { .. })
    }

    /// Shared store paths, if the shared store is reachable
    pub fn shared(&self) -> Option<CachePaths> {
        match self {
            Self::Coordinator { root } => Some(CachePaths::new(root)),
            Self::Client { shared, .. } => Some(CachePaths::new(shared)),
            Self::LocalOnly { .. } => None,
        }
    }

    /// Local accelerator paths, or `None` on the coordinator where the
    /// accelerator is the shared store itself
    pub fn local(&self) -> Option<CachePaths> {
        match self {
            Self::Coordinator { .. } => None,
            Self::Client { local, .. } | Self::LocalOnly { local } => Some(CachePaths::new(local)),
        }
    }

    /// Paths for a tier, if that tier exists on this host
    pub fn tier(&self, tier: Tier) -> Option<CachePaths> {
        match tier {
            Tier::Shared => self.shared(),
            Tier::Local => self.local(),
        }
    }

    /// Tier used for maintenance when none is requested explicitly
    pub fn primary_tier(&self) -> Tier {
        match self {
            Self::Coordinator { .. } | Self::Client { .. } => Tier::Shared,
            Self::LocalOnly { .. } => Tier::Local,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Self::Coordinator { .. } => "coordinator",
            Self::Client { .. } => "client",
            Self::LocalOnly { .. } => "client (shared store unreachable)",
        }
    }
}

impl fmt::Display for StorageTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator { root } => write!(f, "coordinator at {}", root.display()),
            Self::Client { shared, local } => write!(
                f,
                "client of {} (local {})",
                shared.display(),
                local.display()
            ),
            Self::LocalOnly { local } => write!(f, "local only at {}", local.display()),
        }
    }
}

fn is_reachable(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// The coordinator exposes its local storage at the shared path through a
/// symlink (or the two configured roots are the same directory)
fn serves_shared_locally(shared: &Path, local: &Path) -> bool {
    let is_symlink = std::fs::symlink_metadata(shared)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_symlink && is_reachable(shared) {
        return true;
    }

    match (shared.canonicalize(), local.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(shared: PathBuf, local: PathBuf, role: HostRole) -> StorageConfig {
        StorageConfig {
            shared_root: shared,
            local_root: local,
            role,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn entry_id_validation() {
        assert!(EntryId::new("haf", "abc123_def-1.2").is_ok());
        assert!(EntryId::new("", "k").is_err());
        assert!(EntryId::new("haf", "../escape").is_err());
        assert!(EntryId::new("haf", ".hidden").is_err());
        assert!(EntryId::new("haf", "a/b").is_err());
        assert!(EntryId::new("haf", "x".repeat(201)).is_err());
    }

    #[test]
    fn entry_id_parse_and_display() {
        let id: EntryId = "haf/abc123".parse().unwrap();
        assert_eq!(id.cache_type, "haf");
        assert_eq!(id.key, "abc123");
        assert_eq!(id.to_string(), "haf/abc123");
        assert!("no-slash".parse::<EntryId>().is_err());
    }

    #[test]
    fn cache_paths_layout() {
        let paths = CachePaths::new("/nfs/cache");
        let id = EntryId::new("haf", "k1").unwrap();

        assert_eq!(paths.archive(&id), PathBuf::from("/nfs/cache/haf/k1.tar.zst"));
        assert_eq!(paths.metadata(&id), PathBuf::from("/nfs/cache/haf/k1.meta.json"));
        assert_eq!(paths.lock(&id), PathBuf::from("/nfs/cache/haf/k1.lock"));
        assert_eq!(paths.index(), PathBuf::from("/nfs/cache/.lru_index"));

        let partial = paths.partial(&id);
        let name = partial.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("k1."));
        assert!(name.ends_with(PARTIAL_SUFFIX));
        assert_ne!(partial, paths.partial(&id));
    }

    #[test]
    fn archive_name_parsing() {
        assert_eq!(key_from_archive_name("k1.tar.zst"), Some("k1"));
        assert_eq!(key_from_archive_name("k1.meta.json"), None);
        assert_eq!(key_from_archive_name("k1.abc.partial"), None);
        assert_eq!(key_from_archive_name(".tar.zst"), None);
    }

    #[test]
    fn client_when_shared_reachable() {
        let shared = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let topology = StorageTopology::resolve(&storage(
            shared.path().to_path_buf(),
            local.path().to_path_buf(),
            HostRole::Auto,
        ));

        assert!(matches!(topology, StorageTopology::Client { .. }));
        assert_eq!(topology.primary_tier(), Tier::Shared);
        assert!(topology.local().is_some());
    }

    #[test]
    fn local_only_when_shared_missing() {
        let local = TempDir::new().unwrap();
        let topology = StorageTopology::resolve(&storage(
            local.path().join("missing-mount"),
            local.path().to_path_buf(),
            HostRole::Auto,
        ));

        assert!(matches!(topology, StorageTopology::LocalOnly { .. }));
        assert!(topology.shared().is_none());
        assert_eq!(topology.primary_tier(), Tier::Local);
    }

    #[test]
    fn coordinator_when_shared_symlinks_to_local() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("storage");
        std::fs::create_dir(&local).unwrap();
        let shared = temp.path().join("nfs");
        std::os::unix::fs::symlink(&local, &shared).unwrap();

        let topology =
            StorageTopology::resolve(&storage(shared.clone(), local, HostRole::Auto));

        assert_eq!(topology, StorageTopology::Coordinator { root: shared });
        assert!(topology.local().is_none());
    }

    #[test]
    fn explicit_role_wins() {
        let shared = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let topology = StorageTopology::resolve(&storage(
            shared.path().to_path_buf(),
            local.path().to_path_buf(),
            HostRole::Coordinator,
        ));
        assert!(topology.is_coordinator());
    }
}
