//! Configuration schema for treecache
//!
//! Configuration is stored at `~/.config/treecache/config.toml`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Storage roots and archive format
    pub storage: StorageConfig,

    /// Lock timing
    pub lock: LockConfig,

    /// Retention policy
    pub eviction: EvictionConfig,

    /// Per cache type settings, keyed by cache type
    pub types: HashMap<String, TypeConfig>,

    /// Host capability probe
    pub host: HostConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut types = HashMap::new();
        types.insert(
            "haf".to_string(),
            TypeConfig {
                payload: PayloadKind::Postgres,
                ..TypeConfig::default()
            },
        );

        Self {
            general: GeneralConfig::default(),
            storage: StorageConfig::default(),
            lock: LockConfig::default(),
            eviction: EvictionConfig::default(),
            types,
            host: HostConfig::default(),
        }
    }
}

impl Config {
    /// Settings for a cache type, falling back to defaults for unknown types
    pub fn type_config(&self, cache_type: &str) -> TypeConfig {
        self.types.get(cache_type).cloned().unwrap_or_default()
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Write the per-host event journal
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// How this host relates to the shared store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    /// Detect from the filesystem layout
    #[default]
    Auto,
    /// Shared root is local storage on this host
    Coordinator,
    /// Shared root is a remote mount
    Client,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Network filesystem root shared by all hosts
    pub shared_root: PathBuf,

    /// Per-host accelerator root
    pub local_root: PathBuf,

    /// Host role
    pub role: HostRole,

    /// zstd compression level
    pub compression_level: i32,

    /// Verify archive SHA-256 before extracting
    pub verify_checksum: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shared_root: PathBuf::from("/nfs/ci-cache"),
            local_root: PathBuf::from("/cache/treecache"),
            role: HostRole::Auto,
            compression_level: 1,
            verify_checksum: false,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum time to wait for a lock
    pub timeout_secs: u64,

    /// Age after which an unrefreshed lock file is presumed abandoned
    pub stale_after_secs: u64,

    /// Delay between non-blocking lock attempts
    pub poll_interval_ms: u64,

    /// Refresh lock file mtime while a lock is held
    pub heartbeat: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            stale_after_secs: 600,
            poll_interval_ms: 500,
            heartbeat: true,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// How background eviction is launched after a put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundEviction {
    /// In-process tokio task
    Task,
    /// Detached `treecache cleanup` child process
    #[default]
    Process,
    /// Never trigger automatically
    Off,
}

/// Eviction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Size ceiling per tier in GB (0 = unbounded)
    pub max_size_gb: u32,

    /// Exact size ceiling in bytes; takes precedence over `max_size_gb`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,

    /// Remove entries not accessed for N days (0 = disabled)
    pub max_age_days: u32,

    /// Usage percentage of the ceiling that triggers background eviction
    pub trigger_percent: u8,

    /// Background eviction launcher
    pub background: BackgroundEviction,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_size_gb: 2000,
            max_size_bytes: None,
            max_age_days: 30,
            trigger_percent: 90,
            background: BackgroundEviction::Process,
        }
    }
}

impl EvictionConfig {
    /// Effective size ceiling in bytes, `None` when unbounded
    pub fn size_ceiling(&self) -> Option<u64> {
        match self.max_size_bytes {
            Some(bytes) => (bytes > 0).then_some(bytes),
            None => (self.max_size_gb > 0).then(|| gb_to_bytes(self.max_size_gb)),
        }
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_days > 0).then(|| Duration::from_secs(u64::from(self.max_age_days) * 86_400))
    }
}

/// Payload shape stored under a cache type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// Arbitrary directory tree, archived as-is
    #[default]
    Plain,
    /// Tree embedding a PostgreSQL data directory
    Postgres,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

/// Cache type configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeConfig {
    /// Payload normalisation to apply
    pub payload: PayloadKind,

    /// Owner to restore on extracted database files
    pub postgres_uid: Option<u32>,

    /// Group to restore on extracted database files
    pub postgres_gid: Option<u32>,
}

/// Host capability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Hostnames always considered fast
    pub fast_hosts: Vec<String>,

    /// Minimum available CPUs to count as fast (0 = ignore)
    pub min_cpus: usize,

    /// The coordinator serves the shared store from local disk
    pub coordinator_is_fast: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            fast_hosts: vec![],
            min_cpus: 0,
            coordinator_is_fast: true,
        }
    }
}

/// Convert GB to bytes
pub fn gb_to_bytes(gb: u32) -> u64 {
    u64::from(gb) * 1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[storage]"));
        assert!(toml.contains("[lock]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.lock.stale_after_secs, 600);
        assert_eq!(config.type_config("haf").payload, PayloadKind::Postgres);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [storage]
            shared_root = "/mnt/cache"
            role = "client"

            [types.hivemind]
            payload = "postgres"
            postgres_uid = 105
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.shared_root, PathBuf::from("/mnt/cache"));
        assert_eq!(config.storage.role, HostRole::Client);
        assert_eq!(config.lock.timeout_secs, 1800); // default preserved

        let hivemind = config.type_config("hivemind");
        assert_eq!(hivemind.payload, PayloadKind::Postgres);
        assert_eq!(hivemind.postgres_uid, Some(105));
        assert_eq!(config.type_config("unknown").payload, PayloadKind::Plain);
    }

    #[test]
    fn eviction_limits_disable_at_zero() {
        let eviction = EvictionConfig {
            max_size_gb: 0,
            max_age_days: 0,
            ..EvictionConfig::default()
        };
        assert_eq!(eviction.size_ceiling(), None);
        assert_eq!(eviction.max_age(), None);

        let eviction = EvictionConfig::default();
        assert_eq!(eviction.size_ceiling(), Some(gb_to_bytes(2000)));
        assert_eq!(eviction.max_age(), Some(Duration::from_secs(30 * 86_400)));
    }

    #[test]
    fn byte_ceiling_overrides_gb() {
        let config: Config = toml::from_str("[eviction]\nmax_size_bytes = 4096\n").unwrap();
        assert_eq!(config.eviction.size_ceiling(), Some(4096));

        let config: Config =
            toml::from_str("[eviction]\nmax_size_gb = 0\nmax_size_bytes = 0\n").unwrap();
        assert_eq!(config.eviction.size_ceiling(), None);
    }
}
