//! Archive packing, publishing and extraction
//!
//! An archive is a tar stream compressed with zstd. Symlinks are stored as
//! symlinks and modes and mtimes are preserved, so an extracted tree is a
//! faithful copy of the source. Everything here is blocking IO and is run
//! on tokio's blocking pool by the cache layer.

use crate::error::{TreeCacheError, TreeCacheResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Result of packing a source tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackStats {
    pub archive_bytes: u64,
    pub source_bytes: u64,
    pub file_count: u64,
    pub sha256: String,
}

/// Writer that hashes and counts everything passing through it
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Pack `source` into a new archive file at `output`
///
/// `output` is expected to be a temporary name; the caller publishes it
/// with [`publish`]. The file is synced before returning so the rename
/// never exposes unwritten blocks on a network filesystem.
pub fn pack(source: &Path, output: &Path, level: i32) -> TreeCacheResult<PackStats> {
    let err = |e: io::Error| TreeCacheError::archive(output, e);

    let file = File::create(output).map_err(err)?;
    let writer = HashingWriter::new(BufWriter::new(file));
    let encoder = zstd::Encoder::new(writer, level).map_err(err)?;

    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Complete);

    let mut source_bytes = 0u64;
    let mut file_count = 0u64;

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| TreeCacheError::archive(source, e))?;
        let rel = match entry.path().strip_prefix(source) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };

        let file_type = entry.file_type();
        if file_type.is_socket() {
            debug!("Skipping socket {}", entry.path().display());
            continue;
        }
        if file_type.is_file() {
            let len = entry
                .metadata()
                .map_err(|e| TreeCacheError::archive(entry.path(), e))?
                .len();
            source_bytes += len;
        }

        builder
            .append_path_with_name(entry.path(), rel)
            .map_err(|e| TreeCacheError::archive(entry.path(), e))?;
        file_count += 1;
    }

    let encoder = builder.into_inner().map_err(err)?;
    let writer = encoder.finish().map_err(err)?;
    let (buffered, sha256, archive_bytes) = writer.finish();
    let file = buffered.into_inner().map_err(|e| err(e.into_error()))?;
    file.sync_all().map_err(err)?;

    debug!(
        "Packed {} ({} entries) into {} ({} bytes)",
        source.display(),
        file_count,
        output.display(),
        archive_bytes
    );

    Ok(PackStats {
        archive_bytes,
        source_bytes,
        file_count,
        sha256,
    })
}

/// Atomically move a finished temporary archive to its public name
///
/// Readers only ever look for the final name, so they see either no
/// archive or a complete one.
pub fn publish(partial: &Path, archive: &Path) -> TreeCacheResult<()> {
    fs::rename(partial, archive).map_err(|e| {
        TreeCacheError::io(
            format!("publishing {} as {}", partial.display(), archive.display()),
            e,
        )
    })
}

/// Copy an archive to a temporary name in another tier
pub fn copy_archive(from: &Path, to: &Path) -> TreeCacheResult<u64> {
    let err = |e| {
        TreeCacheError::io(
            format!("copying {} to {}", from.display(), to.display()),
            e,
        )
    };
    let bytes = fs::copy(from, to).map_err(err)?;
    File::open(to).and_then(|f| f.sync_all()).map_err(err)?;
    Ok(bytes)
}

/// SHA-256 of a file (hex)
pub fn file_sha256(path: &Path) -> TreeCacheResult<String> {
    let err = |e| TreeCacheError::io(format!("hashing {}", path.display()), e);
    let mut reader = BufReader::new(File::open(path).map_err(err)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = reader.read(&mut buf).map_err(err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare an archive against its recorded checksum
pub fn verify(path: &Path, expected: &str) -> TreeCacheResult<()> {
    let actual = file_sha256(path)?;
    if actual != expected {
        return Err(TreeCacheError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Extract an archive into `dest`
///
/// Contents are unpacked into a staging directory next to `dest` first and
/// moved in afterwards, so a corrupt archive leaves `dest` unchanged.
/// Top-level entries already present in `dest` under the same name are
/// replaced.
pub fn unpack(archive: &Path, dest: &Path) -> TreeCacheResult<()> {
    unpack_with(archive, dest, |_| Ok(()))
}

/// Extract an archive into `dest`, running `finish` on the staged tree
///
/// `finish` sees only the extracted contents. If it fails, the staged tree
/// is discarded and `dest` is left as it was.
pub fn unpack_with<F>(archive: &Path, dest: &Path, finish: F) -> TreeCacheResult<()>
where
    F: FnOnce(&Path) -> TreeCacheResult<()>,
{
    let staging = staging_dir(dest)?;
    fs::create_dir_all(&staging)
        .map_err(|e| TreeCacheError::io(format!("creating {}", staging.display()), e))?;

    let result = unpack_into(archive, &staging)
        .and_then(|_| finish(&staging))
        .and_then(|_| move_contents(&staging, dest));
    if let Err(e) = fs::remove_dir_all(&staging) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Could not remove staging dir {}: {}", staging.display(), e);
        }
    }
    result
}

fn staging_dir(dest: &Path) -> TreeCacheResult<PathBuf> {
    let name = dest.file_name().ok_or_else(|| {
        TreeCacheError::archive(dest, "destination must name a directory")
    })?;
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(parent.join(format!(
        ".{}.{}.staging",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    )))
}

fn unpack_into(archive: &Path, staging: &Path) -> TreeCacheResult<()> {
    let file = File::open(archive).map_err(|e| TreeCacheError::archive(archive, e))?;
    let decoder =
        zstd::Decoder::new(BufReader::new(file)).map_err(|e| TreeCacheError::archive(archive, e))?;

    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);
    tar.set_overwrite(true);
    tar.unpack(staging)
        .map_err(|e| TreeCacheError::archive(archive, e))
}

fn move_contents(staging: &Path, dest: &Path) -> TreeCacheResult<()> {
    fs::create_dir_all(dest)
        .map_err(|e| TreeCacheError::io(format!("creating {}", dest.display()), e))?;

    let entries = fs::read_dir(staging)
        .map_err(|e| TreeCacheError::io(format!("reading {}", staging.display()), e))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| TreeCacheError::io(format!("reading {}", staging.display()), e))?;
        let target = dest.join(entry.file_name());

        if let Ok(existing) = fs::symlink_metadata(&target) {
            let removed = if existing.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            removed
                .map_err(|e| TreeCacheError::io(format!("replacing {}", target.display()), e))?;
        }

        fs::rename(entry.path(), &target)
            .map_err(|e| TreeCacheError::io(format!("moving into {}", target.display()), e))?;
    }
    Ok(())
}
