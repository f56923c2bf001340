//! Validated operations built from parsed arguments
//!
//! Cache types and keys become path components on a shared filesystem, so
//! they are checked here, before any command touches storage.

use crate::cli::args::{CleanupArgs, Commands, OutputFormat};
use crate::config::schema::gb_to_bytes;
use crate::error::{TreeCacheError, TreeCacheResult};
use crate::store::topology::{validate_name, EntryId, Tier};
use std::path::PathBuf;
use std::time::Duration;

/// Limits given on the command line for one cleanup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOverrides {
    pub cache_type: Option<String>,
    /// `Some(None)` lifts the configured ceiling
    pub max_size_bytes: Option<Option<u64>>,
    pub max_age: Option<Duration>,
    pub tier: Option<Tier>,
}

/// A command ready to run against the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Get {
        id: EntryId,
        dest: PathBuf,
    },
    Put {
        id: EntryId,
        source: PathBuf,
    },
    Cleanup(CleanupOverrides),
    List {
        cache_type: Option<String>,
        tier: Option<Tier>,
        format: OutputFormat,
    },
    Status {
        format: OutputFormat,
    },
    IsFastHost,
}

impl TryFrom<Commands> for Operation {
    type Error = TreeCacheError;

    fn try_from(command: Commands) -> TreeCacheResult<Self> {
        Ok(match command {
            Commands::Get(args) => Self::Get {
                id: EntryId::new(args.cache_type, args.key)?,
                dest: args.dest,
            },
            Commands::Put(args) => Self::Put {
                id: EntryId::new(args.cache_type, args.key)?,
                source: args.source,
            },
            Commands::Cleanup(args) => Self::Cleanup(cleanup_overrides(args)?),
            Commands::List(args) => Self::List {
                cache_type: type_filter(args.cache_type)?,
                tier: args.local.then_some(Tier::Local),
                format: args.format,
            },
            Commands::Status(args) => Self::Status {
                format: args.format,
            },
            Commands::IsFastHost => Self::IsFastHost,
        })
    }
}

fn type_filter(cache_type: Option<String>) -> TreeCacheResult<Option<String>> {
    if let Some(ref t) = cache_type {
        validate_name("type", t)?;
    }
    Ok(cache_type)
}

fn cleanup_overrides(args: CleanupArgs) -> TreeCacheResult<CleanupOverrides> {
    let max_size_bytes = match (args.max_size_bytes, args.max_size_gb) {
        (Some(bytes), _) => Some((bytes > 0).then_some(bytes)),
        (None, Some(gb)) => Some((gb > 0).then(|| gb_to_bytes(gb))),
        (None, None) => None,
    };
    let max_age = match (args.max_age_secs, args.max_age_days) {
        (Some(secs), _) => Some(Duration::from_secs(secs)),
        (None, Some(days)) => Some(Duration::from_secs(u64::from(days) * 86_400)),
        (None, None) => None,
    };

    Ok(CleanupOverrides {
        cache_type: type_filter(args.cache_type)?,
        max_size_bytes,
        max_age,
        tier: args.local.then_some(Tier::Local),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::Cli;
    use clap::Parser;

    fn parse(args: &[&str]) -> TreeCacheResult<Operation> {
        let mut argv = vec!["treecache"];
        argv.extend_from_slice(args);
        Operation::try_from(Cli::parse_from(argv).command)
    }

    #[test]
    fn get_builds_entry_id() {
        let op = parse(&["get", "haf", "abc123", "/tmp/d"]).unwrap();
        assert_eq!(
            op,
            Operation::Get {
                id: EntryId::new("haf", "abc123").unwrap(),
                dest: PathBuf::from("/tmp/d"),
            }
        );
    }

    #[test]
    fn traversal_key_is_rejected() {
        let err = parse(&["put", "haf", "../etc", "/tmp/src"]).unwrap_err();
        assert!(matches!(err, TreeCacheError::InvalidName { .. }));

        let err = parse(&["list", "--type", "a/b"]).unwrap_err();
        assert!(matches!(err, TreeCacheError::InvalidName { .. }));
    }

    #[test]
    fn cleanup_limits_are_converted() {
        let op = parse(&["cleanup", "--max-age-days", "2", "--max-size-gb", "1"]).unwrap();
        match op {
            Operation::Cleanup(o) => {
                assert_eq!(o.max_age, Some(Duration::from_secs(2 * 86_400)));
                assert_eq!(o.max_size_bytes, Some(Some(1024 * 1024 * 1024)));
                assert_eq!(o.tier, None);
            }
            other => panic!("expected Cleanup, got {:?}", other),
        }
    }

    #[test]
    fn cleanup_zero_size_lifts_ceiling() {
        let op = parse(&[
            "cleanup",
            "--max-size-gb",
            "0",
            "--max-age-secs",
            "0",
            "--local",
        ])
        .unwrap();
        match op {
            Operation::Cleanup(o) => {
                assert_eq!(o.max_size_bytes, Some(None));
                assert_eq!(o.max_age, Some(Duration::ZERO));
                assert_eq!(o.tier, Some(Tier::Local));
            }
            other => panic!("expected Cleanup, got {:?}", other),
        }
    }

    #[test]
    fn cleanup_byte_ceiling_is_exact() {
        match parse(&["cleanup", "--max-size-bytes", "4096"]).unwrap() {
            Operation::Cleanup(o) => assert_eq!(o.max_size_bytes, Some(Some(4096))),
            other => panic!("expected Cleanup, got {:?}", other),
        }
        match parse(&["cleanup", "--max-size-bytes", "0"]).unwrap() {
            Operation::Cleanup(o) => assert_eq!(o.max_size_bytes, Some(None)),
            other => panic!("expected Cleanup, got {:?}", other),
        }
    }
}
