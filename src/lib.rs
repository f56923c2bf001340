//! Treecache - shared CI artifact cache
//!
//! Stores large directory trees (database snapshots, build outputs) as
//! compressed archives on a network filesystem shared by many CI hosts,
//! with a per-host local accelerator, cross-host locking and LRU eviction.

pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod store;
pub mod ui;

pub use error::{TreeCacheError, TreeCacheResult};
