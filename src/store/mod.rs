//! Artifact store: locking, archives, payload normalisation and eviction

pub mod archive;
pub mod cache;
pub mod entry;
pub mod evict;
pub mod lock;
pub mod lru;
pub mod normalize;
pub mod topology;

pub use cache::{Cache, GetOutcome, PutOutcome, StatusReport, TierStatus};
pub use entry::{format_bytes, CacheSizeStatus, EntryMetadata, EntrySummary};
pub use evict::{BrokenLock, CleanupReport, CleanupRequest};
pub use lock::{LockGuard, LockManager, LockMode};
pub use topology::{CachePaths, EntryId, StorageTopology, Tier};
