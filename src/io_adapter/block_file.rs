//! Block-file IO adapter ("hdfsbsize mode"): the remote LFN
//! is partitioned externally into fixed-size chunks, each backed by its own
//! `File` keyed under a synthesized name `<lfn>___<blocksize>_<offset>`.
//! The adapter's own cinfo is a top-level summary storing only the
//! advertised file size; per-chunk bitmaps live in the chunk Files.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    cache::Cache,
    file::{File, RemoteSource},
};

use super::{CacheIo, CacheIoError, DetachCompletion, DetachOutcome, FStat};

/// Synthesizes the chunk name for logical offset `chunk_offset` of `lfn`.
pub fn chunk_name(lfn: &str, blocksize: u64, chunk_offset: u64) -> String {
    format!("{lfn}___{blocksize}_{chunk_offset}")
}

struct ChunkHandle {
    file: Arc<File>,
    io_id: u64,
    chunk_offset: u64,
    chunk_len: i64,
}

pub struct BlockFileIo {
    cache: Arc<Cache>,
    lfn: String,
    blocksize: u64,
    file_size: i64,
    /// `chunk_index -> ChunkHandle`; populated lazily on first access to
    /// avoid opening every chunk File up front for a sparse read pattern.
    chunks: Mutex<std::collections::HashMap<u64, ChunkHandle>>,
    allow_prefetching: std::sync::atomic::AtomicBool,
    remote_factory: Arc<dyn Fn(u64) -> Arc<dyn RemoteSource> + Send + Sync>,
}

impl BlockFileIo {
    /// `remote_factory` mints a [`RemoteSource`] scoped to chunk `chunk_index`
    /// on demand, since each chunk is fetched from the remote independently.
    pub fn new(
        cache: Arc<Cache>,
        lfn: &str,
        blocksize: u64,
        file_size: i64,
        allow_prefetching: bool,
        remote_factory: Arc<dyn Fn(u64) -> Arc<dyn RemoteSource> + Send + Sync>,
    ) -> Self {
        Self {
            cache,
            lfn: lfn.to_string(),
            blocksize,
            file_size,
            chunks: Mutex::new(std::collections::HashMap::new()),
            allow_prefetching: std::sync::atomic::AtomicBool::new(allow_prefetching),
            remote_factory,
        }
    }

    fn chunk_len(&self, chunk_index: u64) -> i64 {
        let chunk_offset = chunk_index * self.blocksize;
        (self.file_size - chunk_offset as i64).min(self.blocksize as i64).max(0)
    }

    fn handle_for(&self, chunk_index: u64) -> Result<Arc<File>, CacheIoError> {
        let mut chunks = self.chunks.lock();
        if let Some(h) = chunks.get(&chunk_index) {
            return Ok(h.file.clone());
        }

        let chunk_offset = chunk_index * self.blocksize;
        let chunk_len = self.chunk_len(chunk_index);
        if chunk_len <= 0 {
            return Err(CacheIoError::InvalidLayout {
                reason: format!("chunk {chunk_index} is out of range for file_size {}", self.file_size),
            });
        }

        let name = chunk_name(&self.lfn, self.blocksize, chunk_offset);
        let remote = (self.remote_factory)(chunk_index);
        let allow_prefetching = self.allow_prefetching.load(std::sync::atomic::Ordering::Acquire);
        let (file, io_id) = self.cache.get_file(&name, chunk_len, remote, allow_prefetching)?;

        chunks.insert(
            chunk_index,
            ChunkHandle {
                file: file.clone(),
                io_id,
                chunk_offset,
                chunk_len,
            },
        );
        Ok(file)
    }

    /// Resolves `(chunk_index, offset_within_chunk, len_within_chunk)`
    /// triples covering `[offset, offset+len)` of the logical file.
    fn plan(&self, offset: u64, len: u64) -> Vec<(u64, u64, u64)> {
        let mut out = Vec::new();
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let chunk_index = pos / self.blocksize;
            let chunk_start = chunk_index * self.blocksize;
            let within = pos - chunk_start;
            let chunk_len = self.chunk_len(chunk_index).max(0) as u64;
            let avail = chunk_len.saturating_sub(within);
            let take = avail.min(end - pos);
            if take == 0 {
                break;
            }
            out.push((chunk_index, within, take));
            pos += take;
        }
        out
    }
}

impl CacheIo for BlockFileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheIoError> {
        let plan = self.plan(offset, buf.len() as u64);
        let mut copied = 0usize;
        for (chunk_index, within, take) in plan {
            let file = self.handle_for(chunk_index)?;
            let io_id = self.chunks.lock().get(&chunk_index).map(|h| h.io_id).expect("just inserted");
            let n = file.read(io_id, &mut buf[copied..copied + take as usize], within, take)?;
            copied += n;
            if n < take as usize {
                break;
            }
        }
        Ok(copied)
    }

    fn readv(&self, iovecs: &mut [(u64, &mut [u8])]) -> Result<usize, CacheIoError> {
        let mut total = 0;
        for (offset, buf) in iovecs.iter_mut() {
            total += self.read(buf, *offset)?;
        }
        Ok(total)
    }

    fn fstat(&self) -> Result<FStat, CacheIoError> {
        Ok(FStat {
            size: self.file_size,
            blocks: 0,
        })
    }

    fn fsize(&self) -> i64 {
        self.file_size
    }

    fn detach(&self, _completion: Arc<dyn DetachCompletion>) -> DetachOutcome {
        let mut chunks = self.chunks.lock();
        for (_, handle) in chunks.drain() {
            if let Err(e) = self.cache.release_file(&handle.file, handle.io_id) {
                warn!(
                    lfn = %self.lfn,
                    chunk_offset = handle.chunk_offset,
                    chunk_len = handle.chunk_len,
                    error = %e,
                    "failed to release chunk file on detach"
                );
            }
        }
        DetachOutcome::Immediate
    }

    fn update(&self, allow_prefetching: bool) {
        self.allow_prefetching.store(allow_prefetching, std::sync::atomic::Ordering::Release);
        let chunks = self.chunks.lock();
        for handle in chunks.values() {
            handle.file.set_allow_prefetching(handle.io_id, allow_prefetching);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn chunk_name_matches_spec_format() {
        assert_eq!(chunk_name("a/b.dat", 1024, 2048), "a/b.dat___1024_2048");
    }

    #[test]
    fn plan_splits_reads_across_chunk_boundaries() {
        let cache = Cache::new(
            Config::builder(std::env::temp_dir()).block_size(16).build().unwrap(),
            Arc::new(crate::oss::StdOss),
        );
        let adapter = BlockFileIo::new(
            cache,
            "p.dat",
            10,
            25,
            true,
            Arc::new(|idx| Arc::new(crate::file::io_binding::test_support::FakeRemote::new(idx, vec![0u8; 10])) as Arc<dyn RemoteSource>),
        );
        let plan = adapter.plan(5, 15);
        assert_eq!(plan, vec![(0, 5, 5), (1, 0, 10)]);
    }
}
