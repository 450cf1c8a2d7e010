//! Generalized interface for the underlying storage system.
//!
//! This encapsulates exactly how data and cinfo files are opened, stat'd,
//! and deleted, so that the rest of the crate never talks to `std::fs`
//! directly and tests can swap in an in-memory or fault-injecting
//! implementation.
//!
//! Real deployments use [`StdOss`], which is a thin wrapper over `std::fs`
//! plus `nix::sys::statvfs` for the disk-usage queries the resource monitor
//! needs.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use snafu::Snafu;

/// Errors surfaced by the storage layer.
#[derive(Debug, Snafu)]
pub enum OssError {
    #[snafu(display("I/O error on {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("failed to query filesystem stats for {}: {}", path.display(), source))]
    StatVs { path: PathBuf, source: io::Error },
}

impl OssError {
    pub fn to_errno(&self) -> i32 {
        match self {
            OssError::Io { source, .. } | OssError::StatVs { source, .. } => {
                source.raw_os_error().unwrap_or(5)
            }
        }
    }
}

/// Disk usage figures for a mounted filesystem, as returned by `statvfs(2)`.
/// The resource monitor refreshes this periodically for both the data and
/// meta spaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatVs {
    /// Total capacity of the filesystem, in bytes.
    pub total_bytes: u64,
    /// Bytes currently in use (`total_bytes - free_bytes`).
    pub used_bytes: u64,
    /// Bytes free for unprivileged use.
    pub free_bytes: u64,
}

/// Abstraction over the bits of filesystem access the cache engine needs.
///
/// Every path passed to this trait is expected to already be resolved under
/// the configured cache root; `Oss` implementations do not themselves
/// enforce sandboxing (that's [`crate::fs_traversal::FsTraversal`]'s job for
/// directory walks, and [`crate::cache::Cache`]'s job for LFN resolution).
pub trait Oss: Send + Sync + 'static {
    /// Opens (creating if necessary) a file for random-access read/write.
    fn open_rw(&self, path: &Path) -> Result<File, OssError>;

    /// Opens a file for reading only; fails if it does not exist.
    fn open_ro(&self, path: &Path) -> Result<File, OssError>;

    /// Truncates the file at `path` to zero length, creating it if absent.
    fn truncate(&self, path: &Path) -> Result<File, OssError>;

    /// Pre-sizes a sparse file to at least `len` bytes without allocating
    /// the intervening blocks (used to give the data file its logical
    /// extent up front).
    fn set_len(&self, file: &File, path: &Path, len: u64) -> Result<(), OssError>;

    /// Returns the file size in bytes, or `None` if it does not exist.
    fn file_size(&self, path: &Path) -> Result<Option<u64>, OssError>;

    /// Number of 512-byte blocks physically allocated on disk for `path`
    /// (`stat.st_blocks`), used for purge size accounting instead of the
    /// logical file size; `None` if the file does not exist.
    fn allocated_blocks(&self, path: &Path) -> Result<Option<u64>, OssError>;

    /// Last-modified time (unix seconds) for `path`, or `None` if it does
    /// not exist. Used by purge's age fallback when a cinfo has no access
    /// log to consult.
    fn mtime(&self, path: &Path) -> Result<Option<i64>, OssError>;

    /// Deletes a file. Deleting an already-absent file is considered
    /// successful, not an error.
    fn unlink(&self, path: &Path) -> Result<(), OssError>;

    /// Creates all missing parent directories for `path`.
    fn create_dirs(&self, path: &Path) -> Result<(), OssError>;

    /// Removes an empty directory. `ENOENT` is treated as success here too.
    fn remove_dir(&self, path: &Path) -> Result<(), OssError>;

    /// Lists the immediate children of a directory as `(name, is_dir)` pairs.
    fn read_dir(&self, path: &Path) -> Result<Vec<(String, bool)>, OssError>;

    /// Queries disk usage for the filesystem backing `path`.
    fn stat_vs(&self, path: &Path) -> Result<StatVs, OssError>;
}

/// Production [`Oss`] implementation, backed by `std::fs` and `statvfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdOss;

impl Oss for StdOss {
    fn open_rw(&self, path: &Path) -> Result<File, OssError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .context_io(path)
    }

    fn open_ro(&self, path: &Path) -> Result<File, OssError> {
        OpenOptions::new()
            .read(true)
            .open(path)
            .context_io(path)
    }

    fn truncate(&self, path: &Path) -> Result<File, OssError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .context_io(path)
    }

    fn set_len(&self, file: &File, path: &Path, len: u64) -> Result<(), OssError> {
        file.set_len(len).context_io(path)?;
        let mut f = file;
        f.seek(SeekFrom::Start(0)).context_io(path)?;
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<Option<u64>, OssError> {
        match fs::metadata(path) {
            Ok(m) => Ok(Some(m.len())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OssError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn allocated_blocks(&self, path: &Path) -> Result<Option<u64>, OssError> {
        use std::os::unix::fs::MetadataExt;
        match fs::metadata(path) {
            Ok(m) => Ok(Some(m.blocks())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OssError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn mtime(&self, path: &Path) -> Result<Option<i64>, OssError> {
        match fs::metadata(path) {
            Ok(m) => Ok(m.modified().ok().and_then(|t| {
                t.duration_since(std::time::UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OssError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn unlink(&self, path: &Path) -> Result<(), OssError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OssError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn create_dirs(&self, path: &Path) -> Result<(), OssError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context_io(parent)?;
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<(), OssError> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OssError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<(String, bool)>, OssError> {
        let mut out = Vec::new();
        let rd = fs::read_dir(path).context_io(path)?;
        for entry in rd {
            let entry = entry.context_io(path)?;
            let is_dir = entry.file_type().context_io(path)?.is_dir();
            if let Some(name) = entry.file_name().to_str() {
                out.push((name.to_string(), is_dir));
            }
        }
        Ok(out)
    }

    fn stat_vs(&self, path: &Path) -> Result<StatVs, OssError> {
        let vfs = nix::sys::statvfs::statvfs(path).map_err(|e| OssError::StatVs {
            path: path.to_path_buf(),
            source: io::Error::from_raw_os_error(e as i32),
        })?;
        let block_size = vfs.fragment_size().max(1) as u64;
        let total_bytes = vfs.blocks() as u64 * block_size;
        let free_bytes = vfs.blocks_available() as u64 * block_size;
        Ok(StatVs {
            total_bytes,
            free_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
        })
    }
}

/// Small helper trait so call sites above read as `.context_io(path)?`
/// instead of a verbose `map_err`, without needing a dedicated `snafu`
/// context selector for every single I/O call site here.
trait IoResultExt<T> {
    fn context_io(self, path: &Path) -> Result<T, OssError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context_io(self, path: &Path) -> Result<T, OssError> {
        self.map_err(|source| OssError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn unlink_missing_file_is_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.dat");
        assert!(StdOss.unlink(&path).is_ok());
    }

    #[test]
    fn remove_missing_dir_is_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope");
        assert!(StdOss.remove_dir(&path).is_ok());
    }

    #[test]
    fn roundtrip_set_len_and_file_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let f = StdOss.open_rw(&path).unwrap();
        StdOss.set_len(&f, &path, 4096).unwrap();
        assert_eq!(StdOss.file_size(&path).unwrap(), Some(4096));
    }

    #[test]
    fn stat_vs_reports_nonzero_total() {
        let dir = tempdir().unwrap();
        let stats = StdOss.stat_vs(dir.path()).unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.total_bytes >= stats.used_bytes);
    }
}
