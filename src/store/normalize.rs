//! Normalisation for payloads that embed a PostgreSQL data directory
//!
//! A database storage directory cannot be archived and restored naively:
//! its files are owner-only (so another user cannot read them for
//! packing), the server refuses to start unless they are owner-only again
//! afterwards, and tablespaces are reached through absolute symlinks in
//! `pg_tblspc/` that dangle once the tree lives somewhere else.
//!
//! Before archiving, modes are relaxed and absolute tablespace links are
//! rewritten relative to the archive root. After extraction, strict modes
//! (and optionally ownership) are restored and links from archives made
//! before relinking existed are repaired.

use crate::config::schema::TypeConfig;
use crate::error::{TreeCacheError, TreeCacheResult};
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Marker file present at the top of every PostgreSQL data directory
const PG_VERSION: &str = "PG_VERSION";
/// Directory holding tablespace symlinks inside a data directory
const PG_TBLSPC: &str = "pg_tblspc";

const DIR_MODE_STRICT: u32 = 0o700;
const FILE_MODE_STRICT: u32 = 0o600;

/// What a normalisation pass changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NormalizeReport {
    /// Entries whose mode bits were changed
    pub modes_changed: u64,
    /// Symlinks rewritten to relative targets
    pub relinked: u64,
    /// PostgreSQL data directories found
    pub data_dirs: u64,
}

/// Prepare a source tree for archiving
///
/// Adds read (and directory search) bits for everyone so the packer can
/// read files owned by the database user, then rewrites absolute
/// tablespace links. Anything that stays unreadable aborts archiving.
pub fn prepare_for_archive(root: &Path) -> TreeCacheResult<NormalizeReport> {
    let mut report = NormalizeReport::default();
    relax_tree(root, &mut report)?;
    relink_tree(root, &mut report).map_err(|e| TreeCacheError::PayloadPrepare {
        path: root.to_path_buf(),
        reason: e.to_string(),
    })?;
    info!(
        "Prepared {} for archiving: {} modes relaxed, {} links relativised",
        root.display(),
        report.modes_changed,
        report.relinked
    );
    Ok(report)
}

/// Make an extracted tree usable by the database server again
///
/// Any failure here means the payload cannot be used and is reported as
/// `PayloadRestore`; callers treat that like a miss.
pub fn restore_after_extract(root: &Path, settings: &TypeConfig) -> TreeCacheResult<NormalizeReport> {
    let restore_err = |reason: String| TreeCacheError::PayloadRestore {
        path: root.to_path_buf(),
        reason,
    };

    let mut report = NormalizeReport::default();
    relink_tree(root, &mut report).map_err(|e| restore_err(format!("repairing links: {}", e)))?;

    let data_dirs = find_data_dirs(root).map_err(|e| restore_err(e.to_string()))?;
    if data_dirs.is_empty() {
        warn!("No PostgreSQL data directory found under {}", root.display());
    }

    for data_dir in &data_dirs {
        report.data_dirs += 1;
        let mut targets = vec![data_dir.clone()];
        targets.extend(tablespace_dirs(data_dir));

        for target in targets {
            restrict_tree(&target, settings, &mut report)
                .map_err(|e| restore_err(format!("{}: {}", target.display(), e)))?;
        }
    }

    info!(
        "Restored {} data dir(s) under {}: {} modes tightened, {} links repaired",
        report.data_dirs,
        root.display(),
        report.modes_changed,
        report.relinked
    );
    Ok(report)
}

fn relax_tree(path: &Path, report: &mut NormalizeReport) -> TreeCacheResult<()> {
    let prepare_err = |reason: String| TreeCacheError::PayloadPrepare {
        path: path.to_path_buf(),
        reason,
    };

    let meta = fs::symlink_metadata(path).map_err(|e| prepare_err(e.to_string()))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }

    let extra = if meta.is_dir() { 0o555 } else { 0o444 };
    let mode = meta.permissions().mode();
    if mode & extra != extra {
        match fs::set_permissions(path, fs::Permissions::from_mode(mode | extra)) {
            Ok(()) => report.modes_changed += 1,
            Err(e) => debug!("Cannot relax mode of {}: {}", path.display(), e),
        }
    }

    if meta.is_dir() {
        let entries = fs::read_dir(path).map_err(|e| prepare_err(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| prepare_err(e.to_string()))?;
            relax_tree(&entry.path(), report)?;
        }
    } else if meta.is_file() {
        fs::File::open(path).map_err(|e| prepare_err(e.to_string()))?;
    }
    Ok(())
}

fn restrict_tree(root: &Path, settings: &TypeConfig, report: &mut NormalizeReport) -> io::Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let file_type = entry.file_type();

        if settings.postgres_uid.is_some() || settings.postgres_gid.is_some() {
            std::os::unix::fs::lchown(path, settings.postgres_uid, settings.postgres_gid)?;
        }
        if file_type.is_symlink() {
            continue;
        }

        let wanted = if file_type.is_dir() {
            DIR_MODE_STRICT
        } else {
            FILE_MODE_STRICT
        };
        let current = entry.metadata().map_err(io::Error::other)?.permissions().mode();
        if current & 0o7777 != wanted {
            fs::set_permissions(path, fs::Permissions::from_mode(wanted))?;
            report.modes_changed += 1;
        }
    }
    Ok(())
}

fn find_data_dirs(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() && entry.file_name() == PG_VERSION {
            if let Some(parent) = entry.path().parent() {
                // Tablespaces carry PG_VERSION in per-version subdirs too
                if parent.join("global").is_dir() {
                    dirs.push(parent.to_path_buf());
                }
            }
        }
    }
    Ok(dirs)
}

/// Tablespace directories reached through `pg_tblspc` links
fn tablespace_dirs(data_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(data_dir.join(PG_TBLSPC)) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| fs::canonicalize(e.path()).ok())
        .filter(|target| target.is_dir())
        .collect()
}

fn relink_tree(root: &Path, report: &mut NormalizeReport) -> io::Result<()> {
    let links: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_symlink())
        .map(|e| e.into_path())
        .collect();

    for link in links {
        let target = fs::read_link(&link)?;
        if !target.is_absolute() {
            continue;
        }
        let in_tablespace_dir = link
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|n| n == PG_TBLSPC);

        if let Some(relative) = relative_target(root, &link, &target, in_tablespace_dir) {
            debug!(
                "Relinking {}: {} -> {}",
                link.display(),
                target.display(),
                relative.display()
            );
            fs::remove_file(&link)?;
            symlink(&relative, &link)?;
            report.relinked += 1;
        }
    }
    Ok(())
}

/// Compute a root-relative replacement for an absolute link target
///
/// Targets inside `root` are always rewritten. For tablespace links, a
/// target from another mount layout is matched by the longest trailing
/// path suffix that exists under `root`.
fn relative_target(root: &Path, link: &Path, target: &Path, suffix_match: bool) -> Option<PathBuf> {
    let link_dir = link.parent()?.strip_prefix(root).ok()?;

    let canonical_root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    let inside = target
        .strip_prefix(root)
        .or_else(|_| target.strip_prefix(&canonical_root))
        .ok()
        .map(Path::to_path_buf);

    let in_root = match inside {
        Some(rel) => rel,
        None if suffix_match => longest_existing_suffix(root, target)?,
        None => return None,
    };

    let mut relative = PathBuf::new();
    for _ in link_dir.components() {
        relative.push("..");
    }
    relative.push(in_root);
    Some(relative)
}

fn longest_existing_suffix(root: &Path, target: &Path) -> Option<PathBuf> {
    let parts: Vec<&std::ffi::OsStr> = target
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s),
            _ => None,
        })
        .collect();

    (0..parts.len()).find_map(|start| {
        let suffix: PathBuf = parts[start..].iter().collect();
        let candidate = root.join(&suffix);
        fs::symlink_metadata(&candidate)
            .ok()
            .filter(|m| m.is_dir())
            .map(|_| suffix)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Lays out `<root>/haf_db_store/{pgdata,tablespace}` with an absolute
    /// tablespace link, like a freshly produced database directory
    fn database_tree(root: &Path, link_target: &Path) -> PathBuf {
        let pgdata = root.join("haf_db_store/pgdata");
        fs::create_dir_all(pgdata.join("global")).unwrap();
        fs::create_dir_all(pgdata.join(PG_TBLSPC)).unwrap();
        fs::create_dir_all(root.join("haf_db_store/tablespace/PG_16")).unwrap();
        fs::write(pgdata.join(PG_VERSION), b"16\n").unwrap();
        fs::write(pgdata.join("global/pg_control"), b"ctl").unwrap();
        fs::write(root.join("haf_db_store/tablespace/PG_16/data"), b"rows").unwrap();
        symlink(link_target, pgdata.join("pg_tblspc/16396")).unwrap();
        pgdata
    }

    #[test]
    fn prepare_relativises_link_inside_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("datadir");
        let pgdata = database_tree(&root, &root.join("haf_db_store/tablespace"));

        let report = prepare_for_archive(&root).unwrap();
        assert_eq!(report.relinked, 1);

        let link = fs::read_link(pgdata.join("pg_tblspc/16396")).unwrap();
        assert_eq!(link, PathBuf::from("../../../haf_db_store/tablespace"));
        assert!(pgdata.join("pg_tblspc/16396/PG_16/data").exists());
    }

    #[test]
    fn prepare_relaxes_owner_only_modes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("datadir");
        let pgdata = database_tree(&root, &root.join("haf_db_store/tablespace"));
        fs::set_permissions(pgdata.join("global/pg_control"), fs::Permissions::from_mode(0o600))
            .unwrap();
        fs::set_permissions(&pgdata, fs::Permissions::from_mode(0o700)).unwrap();

        prepare_for_archive(&root).unwrap();

        let file_mode = fs::metadata(pgdata.join("global/pg_control"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o444, 0o444);
        let dir_mode = fs::metadata(&pgdata).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o555, 0o555);
    }

    #[test]
    fn restore_repairs_foreign_absolute_link() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("extracted");
        // Produced on another host where the tree lived under /home/hived/datadir
        let pgdata = database_tree(
            &root,
            Path::new("/home/hived/datadir/haf_db_store/tablespace"),
        );

        let report = restore_after_extract(&root, &TypeConfig::default()).unwrap();
        assert_eq!(report.relinked, 1);
        assert_eq!(report.data_dirs, 1);

        let link = fs::read_link(pgdata.join("pg_tblspc/16396")).unwrap();
        assert!(link.is_relative());
        assert!(pgdata.join("pg_tblspc/16396/PG_16/data").exists());
    }

    #[test]
    fn restore_sets_strict_modes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("extracted");
        let pgdata = database_tree(&root, &root.join("haf_db_store/tablespace"));
        fs::set_permissions(pgdata.join("global/pg_control"), fs::Permissions::from_mode(0o644))
            .unwrap();

        restore_after_extract(&root, &TypeConfig::default()).unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(&pgdata), 0o700);
        assert_eq!(mode(&pgdata.join("global")), 0o700);
        assert_eq!(mode(&pgdata.join("global/pg_control")), 0o600);
        assert_eq!(mode(&root.join("haf_db_store/tablespace")), 0o700);
        assert_eq!(mode(&root.join("haf_db_store/tablespace/PG_16/data")), 0o600);
    }

    #[test]
    fn unrelated_absolute_links_untouched() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tree");
        fs::create_dir_all(root.join("bin")).unwrap();
        symlink("/usr/bin", root.join("tools")).unwrap();

        let report = prepare_for_archive(&root).unwrap();
        assert_eq!(report.relinked, 0);
        assert_eq!(fs::read_link(root.join("tools")).unwrap(), PathBuf::from("/usr/bin"));
    }

    #[test]
    fn restore_without_data_dir_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("file"), b"x").unwrap();
        let report = restore_after_extract(temp.path(), &TypeConfig::default()).unwrap();
        assert_eq!(report.data_dirs, 0);
    }

    #[test]
    fn chown_failure_is_restore_error() {
        // Changing ownership to another user fails unless running as root
        if rustix::process::geteuid().is_root() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("extracted");
        database_tree(&root, &root.join("haf_db_store/tablespace"));

        let settings = TypeConfig {
            postgres_uid: Some(0),
            ..TypeConfig::default()
        };
        let err = restore_after_extract(&root, &settings).unwrap_err();
        assert!(matches!(err, TreeCacheError::PayloadRestore { .. }));
        assert!(err.is_miss_equivalent());
    }
}
