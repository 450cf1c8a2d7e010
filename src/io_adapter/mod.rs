//! Public read-only cache interface and its two adapters:
//! entire-file IO (one [`crate::file::File`] per remote LFN) and block-file
//! IO ("hdfsbsize mode", one `File` per externally-defined chunk).

pub mod block_file;
pub mod entire;

pub use block_file::BlockFileIo;
pub use entire::EntireFileIo;

use snafu::Snafu;

use crate::{cache::CacheError, file::FileError, oss::OssError};

#[derive(Debug, Snafu)]
pub enum CacheIoError {
    #[snafu(display("file error: {}", source))]
    File { source: FileError },

    #[snafu(display("storage error: {}", source))]
    Storage { source: OssError },

    #[snafu(display("cache error: {}", source))]
    Cache { source: CacheError },

    #[snafu(display("invalid chunk layout: {}", reason))]
    InvalidLayout { reason: String },
}

impl From<FileError> for CacheIoError {
    fn from(source: FileError) -> Self {
        CacheIoError::File { source }
    }
}

impl From<OssError> for CacheIoError {
    fn from(source: OssError) -> Self {
        CacheIoError::Storage { source }
    }
}

impl From<CacheError> for CacheIoError {
    fn from(source: CacheError) -> Self {
        CacheIoError::Cache { source }
    }
}

/// Outcome of [`CacheIo::detach`]: whether the adapter may be torn down
/// immediately, or must defer and signal back via [`DetachCompletion`].
pub enum DetachOutcome {
    /// Safe to destroy the adapter now.
    Immediate,
    /// Destruction must wait; the caller will be notified through the
    /// `DetachCompletion` handle it supplied.
    Deferred,
}

/// Callback handle an adapter invokes once a deferred detach has finished
/// draining.
pub trait DetachCompletion: Send + Sync {
    fn detach_done(&self);
}

/// Public read-only cache interface shared by both IO adapters.
pub trait CacheIo: Send + Sync {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheIoError>;

    fn readv(&self, iovecs: &mut [(u64, &mut [u8])]) -> Result<usize, CacheIoError>;

    /// Page-aligned read with inline checksum verification; falls back to a
    /// plain `read` for adapters that do not implement per-page checksums.
    fn pg_read(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheIoError> {
        self.read(buf, offset)
    }

    fn fstat(&self) -> Result<FStat, CacheIoError>;

    fn fsize(&self) -> i64;

    /// Detaches this adapter's hold on its underlying file(s). See
    /// [`DetachOutcome`].
    fn detach(&self, completion: std::sync::Arc<dyn DetachCompletion>) -> DetachOutcome;

    /// Refreshes any externally-supplied hints (e.g. a new `allow_prefetching`
    /// value for the IOs this adapter owns).
    fn update(&self, allow_prefetching: bool);
}

/// Minimal stat shape the adapters report; mirrors the subset of `struct
/// stat` a read-only file-size query needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FStat {
    pub size: i64,
    pub blocks: u64,
}
