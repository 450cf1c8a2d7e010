//! Entire-file IO adapter: one [`crate::file::File`] backs the whole remote LFN.

use std::sync::Arc;

use crate::{
    cache::Cache,
    file::{File, RemoteSource},
};

use super::{CacheIo, CacheIoError, DetachCompletion, DetachOutcome, FStat};

/// Wraps a single `File` and the IO id attached to it on behalf of one
/// caller session.
pub struct EntireFileIo {
    cache: Arc<Cache>,
    file: Arc<File>,
    io_id: u64,
}

impl EntireFileIo {
    /// Opens (or joins) the `File` for `lfn` and attaches a new IO to it.
    pub fn open(
        cache: Arc<Cache>,
        lfn: &str,
        file_size: i64,
        remote: Arc<dyn RemoteSource>,
        allow_prefetching: bool,
    ) -> Result<Self, CacheIoError> {
        let (file, io_id) = cache.get_file(lfn, file_size, remote, allow_prefetching)?;
        Ok(Self { cache, file, io_id })
    }

    pub fn lfn(&self) -> &str {
        self.file.lfn()
    }
}

impl CacheIo for EntireFileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheIoError> {
        let n = self.file.read(self.io_id, buf, offset, buf.len() as u64)?;
        Ok(n)
    }

    fn readv(&self, iovecs: &mut [(u64, &mut [u8])]) -> Result<usize, CacheIoError> {
        let n = self.file.readv(self.io_id, iovecs)?;
        Ok(n)
    }

    fn fstat(&self) -> Result<FStat, CacheIoError> {
        let blocks = self
            .cache
            .oss()
            .allocated_blocks(self.file.data_path())
            .unwrap_or(None)
            .unwrap_or(0);
        Ok(FStat {
            size: self.file.file_size(),
            blocks,
        })
    }

    fn fsize(&self) -> i64 {
        self.file.file_size()
    }

    fn detach(&self, _completion: Arc<dyn DetachCompletion>) -> DetachOutcome {
        // `io_active` only reports unfinished prefetches attributed to this
        // IO; with no prefetch coordinator issuing those yet (see
        // DESIGN.md), it is always false and detach completes inline.
        if self.file.io_active(self.io_id) {
            return DetachOutcome::Deferred;
        }
        if let Err(e) = self.cache.release_file(&self.file, self.io_id) {
            warn!(lfn = self.file.lfn(), error = %e, "failed to release file on detach");
        }
        DetachOutcome::Immediate
    }

    fn update(&self, allow_prefetching: bool) {
        self.file.set_allow_prefetching(self.io_id, allow_prefetching);
    }
}

