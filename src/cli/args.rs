//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Treecache - shared CI artifact cache for large directory trees
///
/// Stores directory trees as compressed archives on a shared network
/// filesystem, with a per-host local accelerator and cross-host locking.
#[derive(Parser, Debug)]
#[command(name = "treecache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "TREECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Shared store root (overrides storage.shared_root)
    #[arg(long, global = true, env = "TREECACHE_SHARED_ROOT")]
    pub shared_root: Option<PathBuf>,

    /// Local accelerator root (overrides storage.local_root)
    #[arg(long, global = true, env = "TREECACHE_LOCAL_ROOT")]
    pub local_root: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract a cached tree into a directory (exit 2 on miss)
    Get(GetArgs),

    /// Publish a directory tree to the cache
    Put(PutArgs),

    /// Evict old entries and reclaim orphaned temporary files
    Cleanup(CleanupArgs),

    /// List cached entries
    List(ListArgs),

    /// Show topology and usage of every tier
    Status(StatusArgs),

    /// Print whether this host should receive expensive jobs (exit 1 if not)
    IsFastHost,
}

/// Arguments for the get command
#[derive(Parser, Debug)]
pub struct GetArgs {
    /// Cache type (e.g. haf)
    #[arg(value_name = "TYPE")]
    pub cache_type: String,

    /// Cache key
    pub key: String,

    /// Destination directory
    pub dest: PathBuf,
}

/// Arguments for the put command
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// Cache type (e.g. haf)
    #[arg(value_name = "TYPE")]
    pub cache_type: String,

    /// Cache key
    pub key: String,

    /// Source directory to archive
    pub source: PathBuf,
}

/// Arguments for the cleanup command
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Only consider entries of this cache type
    #[arg(long = "type", value_name = "TYPE")]
    pub cache_type: Option<String>,

    /// Size ceiling in GB (default: from config, 0 = unbounded)
    #[arg(long, conflicts_with = "max_size_bytes")]
    pub max_size_gb: Option<u32>,

    /// Size ceiling in bytes (0 = unbounded)
    #[arg(long)]
    pub max_size_bytes: Option<u64>,

    /// Remove entries not accessed for N days (default: from config)
    #[arg(long, conflicts_with = "max_age_secs")]
    pub max_age_days: Option<u32>,

    /// Remove entries not accessed for N seconds
    #[arg(long)]
    pub max_age_secs: Option<u64>,

    /// Clean the local accelerator instead of the shared store
    #[arg(long)]
    pub local: bool,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only list entries of this cache type
    #[arg(long = "type", value_name = "TYPE")]
    pub cache_type: Option<String>,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,

    /// List the local accelerator instead of the shared store
    #[arg(long)]
    pub local: bool,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Output format for list and status
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}
