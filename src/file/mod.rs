//! `File`: the per-open-LFN object that owns the block map, the write
//! queue, the prefetch bookkeeping, and RAM-to-disk coordination. This is
//! the largest single component of the cache engine.

pub mod io_binding;
pub mod prefetch;
pub mod write_queue;

use std::{
    collections::{HashMap, HashSet},
    io,
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Condvar, Mutex};
use snafu::Snafu;

use crate::{
    block::{Block, IoId},
    cksum,
    config::{CkSumPolicy, Config},
    errors::{eio, einval, enoent},
    info::{Info, InfoError},
    oss::{Oss, OssError},
};

pub use io_binding::{IoAttachState, RemoteSource};
pub use prefetch::PrefetchState;
pub use write_queue::{WriteSink, WriteTask};

#[derive(Debug, Snafu)]
pub enum FileError {
    #[snafu(display("storage error: {}", source))]
    Storage { source: OssError },

    #[snafu(display("cinfo error: {}", source))]
    Info { source: InfoError },

    #[snafu(display("file is in emergency shutdown"))]
    ShutDown,

    #[snafu(display("no healthy IO available to service read"))]
    NoHealthyIo,

    #[snafu(display("remote read error: {}", source))]
    Remote { source: io::Error },

    #[snafu(display("failed to persist block or cinfo data: {}", source))]
    Persist { source: io::Error },

    #[snafu(display("invalid read range: offset={} len={} file_size={}", offset, len, file_size))]
    OutOfRange { offset: u64, len: u64, file_size: i64 },

    #[snafu(display("page checksum mismatch for block {}", block_index))]
    ChecksumMismatch { block_index: u64 },
}

impl FileError {
    pub fn to_errno(&self) -> i32 {
        match self {
            FileError::ShutDown => enoent(),
            FileError::OutOfRange { .. } => einval(),
            FileError::Remote { source } | FileError::Persist { source } => {
                source.raw_os_error().unwrap_or(eio())
            }
            _ => eio(),
        }
    }
}

impl From<OssError> for FileError {
    fn from(source: OssError) -> Self {
        FileError::Storage { source }
    }
}

impl From<InfoError> for FileError {
    fn from(source: InfoError) -> Self {
        FileError::Info { source }
    }
}

/// Per-file delta statistics accumulated since the last sample was handed to
/// [`crate::resource_monitor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsDelta {
    pub bytes_hit: u64,
    pub bytes_missed: u64,
    pub bytes_bypassed: u64,
    pub bytes_written: u64,
}

impl StatsDelta {
    pub fn take(&mut self) -> StatsDelta {
        std::mem::take(self)
    }

    pub fn is_zero(&self) -> bool {
        self.bytes_hit == 0 && self.bytes_missed == 0 && self.bytes_bypassed == 0 && self.bytes_written == 0
    }
}

struct FileInner {
    info: Info,
    blocks: HashMap<u64, Arc<Block>>,
    ios: HashMap<IoId, (Arc<dyn RemoteSource>, IoAttachState)>,
    prefetch_state: PrefetchState,
    shutdown: bool,
    non_flushed: u32,
    unsynced_writes: bool,
    detach_log_pending: bool,
    stats: StatsDelta,
}

/// One open logical file. Always lives behind an `Arc`: fetch threads and
/// write-queue workers each hold a clone so they can outlive the call that
/// spawned them.
pub struct File {
    lfn: String,
    data_path: PathBuf,
    cinfo_path: PathBuf,
    config: Arc<Config>,
    #[allow(dead_code)]
    oss: Arc<dyn Oss>,
    write_sink: Arc<dyn WriteSink>,
    data_fd: Mutex<std::fs::File>,
    cinfo_fd: Mutex<std::fs::File>,
    inner: Mutex<FileInner>,
    cond: Condvar,
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

fn default_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl File {
    /// Resolves the data and cinfo paths for `lfn` under `config`'s roots.
    pub fn resolve_paths(config: &Config, lfn: &str) -> (PathBuf, PathBuf) {
        let lfn = lfn.trim_start_matches('/');
        let data_path = config.data_dir.join(lfn);
        let cinfo_path = config.meta_dir.join(format!("{lfn}.cinfo"));
        (data_path, cinfo_path)
    }

    /// Opens (or creates) the file described by `lfn`. If a valid cinfo
    /// exists on disk and matches `file_size`, its bitmap is reused;
    /// otherwise both files are reset to empty, treating the stale pair as
    /// corrupt rather than trusting a size mismatch.
    pub fn open(
        lfn: &str,
        file_size: i64,
        config: Arc<Config>,
        oss: Arc<dyn Oss>,
        write_sink: Arc<dyn WriteSink>,
    ) -> Result<Arc<Self>, FileError> {
        Self::open_with_clock(lfn, file_size, config, oss, write_sink, Arc::new(default_now))
    }

    pub fn open_with_clock(
        lfn: &str,
        file_size: i64,
        config: Arc<Config>,
        oss: Arc<dyn Oss>,
        write_sink: Arc<dyn WriteSink>,
        now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
    ) -> Result<Arc<Self>, FileError> {
        let (data_path, cinfo_path) = Self::resolve_paths(&config, lfn);
        oss.create_dirs(&data_path)?;
        oss.create_dirs(&cinfo_path)?;

        let now = now_fn();
        let cinfo_fd = oss.open_rw(&cinfo_path)?;
        let info = match Self::try_load_info(&cinfo_fd, config.max_access_log_entries) {
            Some(info) if info.file_size() == file_size => {
                Self::reconcile_cksum_policy(info, config.cksum_policy, config.uvkeep, config.max_access_log_entries, now, lfn)
            }
            _ => {
                debug!(lfn, "cinfo missing or invalid; resetting");
                Info::create(file_size, config.block_size as i64, config.cksum_policy, config.max_access_log_entries, now)
            }
        };

        let data_fd = oss.open_rw(&data_path)?;
        oss.set_len(&data_fd, &data_path, file_size.max(0) as u64)?;

        let initial_state = if info.is_complete() {
            PrefetchState::Complete
        } else {
            PrefetchState::Stopped
        };

        let file = Arc::new(Self {
            lfn: lfn.to_string(),
            data_path,
            cinfo_path,
            config,
            oss,
            write_sink,
            data_fd: Mutex::new(data_fd),
            cinfo_fd: Mutex::new(cinfo_fd),
            inner: Mutex::new(FileInner {
                info,
                blocks: HashMap::new(),
                ios: HashMap::new(),
                prefetch_state: initial_state,
                shutdown: false,
                non_flushed: 0,
                unsynced_writes: false,
                detach_log_pending: false,
                stats: StatsDelta::default(),
            }),
            cond: Condvar::new(),
            now_fn,
        });

        {
            let mut inner = file.inner.lock();
            file.persist_cinfo_locked(&mut inner)?;
        }
        Ok(file)
    }

    /// Reconciles a loaded `Info`'s on-disk checksum policy against the
    /// configured one. A weaker configured policy is always safe to apply in
    /// place. A stronger configured policy (one requiring bits the file
    /// doesn't have) is applied in place without a reset once `uvkeep` has
    /// elapsed since the cinfo was created -- past pages simply stay
    /// unverified and get CRCs as they're re-fetched -- but forces a full
    /// reset while the file is still "fresh", since a short-lived file is
    /// cheaper to refetch whole than to leave half-covered by the new policy.
    fn reconcile_cksum_policy(mut info: Info, configured: CkSumPolicy, uvkeep: std::time::Duration, max_access: usize, now: i64, lfn: &str) -> Info {
        let on_disk = info.cksum_policy();
        if configured < on_disk {
            info.downgrade_cksum_policy(configured);
        } else if configured > on_disk {
            let age = now.saturating_sub(info.created_at());
            if age >= uvkeep.as_secs() as i64 {
                info.upgrade_cksum_policy_accept_missing(configured);
            } else {
                debug!(lfn, age, uvkeep_secs = uvkeep.as_secs(), "cksum policy upgrade within uvkeep window; resetting cinfo");
                return Info::create(info.file_size(), info.buffer_size(), configured, max_access, now);
            }
        }
        info
    }

    fn try_load_info(fd: &std::fs::File, max_access: usize) -> Option<Info> {
        use std::io::{Read, Seek, SeekFrom};
        let mut fd = fd.try_clone().ok()?;
        fd.seek(SeekFrom::Start(0)).ok()?;
        let mut buf = Vec::new();
        fd.read_to_end(&mut buf).ok()?;
        if buf.is_empty() {
            return None;
        }
        let mut cursor = io::Cursor::new(buf);
        Info::read(&mut cursor, max_access).ok()
    }

    pub fn lfn(&self) -> &str {
        &self.lfn
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn cinfo_path(&self) -> &Path {
        &self.cinfo_path
    }

    pub fn file_size(&self) -> i64 {
        self.inner.lock().info.file_size()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().info.is_complete()
    }

    pub fn prefetch_state(&self) -> PrefetchState {
        self.inner.lock().prefetch_state
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    /// Number of attached IOs. Used by [`crate::cache::Cache`] to decide
    /// whether an LFN is still active.
    pub fn io_count(&self) -> usize {
        self.inner.lock().ios.len()
    }

    fn now(&self) -> i64 {
        (self.now_fn)()
    }

    fn persist_cinfo_locked(&self, inner: &mut FileInner) -> Result<(), FileError> {
        use std::io::{Seek, SeekFrom, Write};
        let mut fd = self.cinfo_fd.lock();
        fd.set_len(0).map_err(|source| FileError::Persist { source })?;
        fd.seek(SeekFrom::Start(0)).map_err(|source| FileError::Persist { source })?;
        inner.info.write(&mut *fd)?;
        fd.flush().map_err(|source| FileError::Persist { source })?;
        Ok(())
    }

    // ---- IO attach/detach -------------------------------------------------

    /// Attaches a new IO to this file. Transitions `Stopped -> On` on the
    /// first attach if prefetch is enabled by configuration.
    pub fn add_io(&self, io: Arc<dyn RemoteSource>, allow_prefetching: bool) {
        let now = self.now();
        let mut inner = self.inner.lock();
        let was_empty = inner.ios.is_empty();
        inner
            .ios
            .insert(io.id(), (io.clone(), IoAttachState::new(now, allow_prefetching)));
        if was_empty {
            inner.info.write_io_stat_attach(now);
            inner.detach_log_pending = true;
            inner.prefetch_state = inner.prefetch_state.on_first_io_attached(self.config.prefetch.enabled);
        }
        self.refresh_quiet_state(&mut inner);
    }

    fn refresh_quiet_state(&self, inner: &mut FileInner) {
        if inner.ios.is_empty() {
            return;
        }
        let all_quiet = inner.ios.values().all(|(_, st)| !st.allow_prefetching);
        inner.prefetch_state = if all_quiet {
            inner.prefetch_state.on_all_ios_quiet()
        } else {
            inner.prefetch_state.on_any_io_resumed()
        };
    }

    /// Updates whether `io_id` currently allows prefetching, re-evaluating
    /// the `On <-> Hold` transition across all attached IOs.
    pub fn set_allow_prefetching(&self, io_id: IoId, allow: bool) {
        let mut inner = self.inner.lock();
        if let Some((_, state)) = inner.ios.get_mut(&io_id) {
            state.allow_prefetching = allow;
        }
        self.refresh_quiet_state(&mut inner);
    }

    /// `true` if `io_id` cannot be released yet because it has unfinished
    /// prefetches still attributable to it.
    pub fn io_active(&self, io_id: IoId) -> bool {
        let inner = self.inner.lock();
        inner
            .ios
            .get(&io_id)
            .map(|(_, st)| st.active_prefetch_count > 0)
            .unwrap_or(false)
    }

    /// Detaches `io_id`. Returns `Some((now, stats))` if this was the last
    /// attached IO, carrying the detach time and the stats delta just
    /// folded into the cinfo access record, for the caller ([`crate::cache::Cache`])
    /// to forward as a close event. Returns `None` if other IOs remain
    /// attached.
    pub fn detach(&self, io_id: IoId) -> Option<(i64, StatsDelta)> {
        let now = self.now();
        let mut inner = self.inner.lock();
        inner.ios.remove(&io_id);
        let last_detach = inner.ios.is_empty();
        if !last_detach {
            self.refresh_quiet_state(&mut inner);
            return None;
        }

        inner.prefetch_state = inner.prefetch_state.on_last_io_detached();
        let stats = if inner.detach_log_pending {
            let stats = inner.stats.take();
            inner.info.write_io_stat_detach(
                now,
                stats.bytes_hit as i64,
                stats.bytes_missed as i64,
                stats.bytes_bypassed as i64,
            );
            inner.detach_log_pending = false;
            inner.unsynced_writes = true;
            stats
        } else {
            inner.stats.take()
        };
        Some((now, stats))
    }

    /// If unsynced writes remain, the non-flushed counter is nonzero, or the
    /// detach-time access record has not been persisted yet, flushes cinfo
    /// to disk now. Called before the cache lets go of a fully-detached file.
    pub fn finalize_sync_before_exit(&self) -> Result<(), FileError> {
        let mut inner = self.inner.lock();
        if inner.unsynced_writes || inner.non_flushed > 0 || inner.detach_log_pending {
            self.persist_cinfo_locked(&mut inner)?;
            inner.non_flushed = 0;
            inner.unsynced_writes = false;
        }
        Ok(())
    }

    // ---- Emergency shutdown ------------------------------------------------

    /// Halts prefetch and flags the file so future reads immediately fail.
    /// Writes already queued are still allowed to drain. Sticky: never cleared.
    pub fn emergency_shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return;
        }
        warn!(lfn = %self.lfn, "emergency shutdown");
        inner.shutdown = true;
        inner.prefetch_state = inner.prefetch_state.on_emergency_shutdown();
        drop(inner);
        self.cond.notify_all();
    }

    // ---- Read path ----------------------------------------------------------

    /// Synchronous read: resolve the covered block range, reuse or create
    /// blocks, fill disk hits
    /// in-line and remote misses on dedicated fetch threads, wait for all of
    /// them, then copy the overlapping bytes into `buf`.
    #[instrument(skip(self, buf), level = "trace", fields(lfn = %self.lfn))]
    pub fn read(self: &Arc<Self>, io_id: IoId, buf: &mut [u8], offset: u64, len: u64) -> Result<usize, FileError> {
        if self.is_shutdown() {
            return Err(FileError::ShutDown);
        }

        let file_size = self.file_size();
        if offset as i64 > file_size {
            return Err(FileError::OutOfRange { offset, len, file_size });
        }
        let len = len.min((file_size as u64).saturating_sub(offset));
        if len == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..len as usize];

        let block_size = self.config.block_size;
        let first_block = offset / block_size;
        let last_block = (offset + len - 1) / block_size;

        let io_source = {
            let inner = self.inner.lock();
            inner
                .ios
                .get(&io_id)
                .map(|(source, _)| source.clone())
                .ok_or(FileError::NoHealthyIo)?
        };

        let mut needed: Vec<Arc<Block>> = Vec::with_capacity((last_block - first_block + 1) as usize);
        let mut disk_hits: Vec<Arc<Block>> = Vec::new();
        let mut to_fetch: Vec<Arc<Block>> = Vec::new();
        let mut hit_indices: HashSet<u64> = HashSet::new();

        {
            let mut inner = self.inner.lock();
            for idx in first_block..=last_block {
                if let Some(existing) = inner.blocks.get(&idx) {
                    existing.inc_ref();
                    needed.push(existing.clone());
                    continue;
                }

                let block_offset = idx * block_size;
                let block_len = block_size.min((file_size as u64).saturating_sub(block_offset)) as usize;
                let block = Arc::new(Block::new(idx, block_offset, block_len, block_len, false, false));
                block.set_last_io(io_id);
                inner.blocks.insert(idx, block.clone());
                needed.push(block.clone());

                if inner.info.test_bit_written(idx as usize) {
                    hit_indices.insert(idx);
                    disk_hits.push(block);
                } else {
                    to_fetch.push(block);
                }
            }
        }

        for block in &disk_hits {
            match self.fill_from_disk(block) {
                Ok(()) => {
                    if self.verify_block_crcs(block, |p| matches!(p, CkSumPolicy::Cache | CkSumPolicy::Both)) {
                        block.set_downloaded();
                    } else {
                        warn!(lfn = %self.lfn, block = block.index(), "page checksum mismatch on cache hit");
                        self.emergency_shutdown();
                        block.set_error(-eio());
                    }
                }
                Err(e) => block.set_error(-(e.raw_os_error().unwrap_or(eio()))),
            }
        }
        if !disk_hits.is_empty() {
            self.cond.notify_all();
        }

        let mut handles = Vec::with_capacity(to_fetch.len());
        for block in to_fetch {
            let file = Arc::clone(self);
            let io_source = io_source.clone();
            handles.push(std::thread::spawn(move || fetch_block(file, block, io_id, io_source)));
        }
        for h in handles {
            let _ = h.join();
        }

        {
            let mut inner = self.inner.lock();
            while !needed.iter().all(|b| b.is_finished()) && !inner.shutdown {
                self.cond.wait(&mut inner);
            }
        }

        if self.is_shutdown() {
            let mut inner = self.inner.lock();
            for block in &needed {
                if block.dec_ref() == 0 {
                    inner.blocks.remove(&block.index());
                }
            }
            return Err(FileError::ShutDown);
        }

        let mut first_err: Option<i32> = None;
        let mut copied = 0usize;
        let mut hit_bytes = 0u64;
        let mut miss_bytes = 0u64;

        for block in &needed {
            let block_start = block.offset();
            let block_end = block_start + block.size() as u64;
            let overlap_start = offset.max(block_start);
            let overlap_end = (offset + len).min(block_end);
            if overlap_start < overlap_end {
                if block.is_ok() {
                    let src_off = (overlap_start - block_start) as usize;
                    let dst_off = (overlap_start - offset) as usize;
                    let n = (overlap_end - overlap_start) as usize;
                    buf[dst_off..dst_off + n].copy_from_slice(&block.data()[src_off..src_off + n]);
                    copied += n;
                    if hit_indices.contains(&block.index()) {
                        hit_bytes += n as u64;
                    } else {
                        miss_bytes += n as u64;
                    }
                } else if first_err.is_none() {
                    first_err = Some(block.errno());
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.stats.bytes_hit += hit_bytes;
            inner.stats.bytes_missed += miss_bytes;
            for block in &needed {
                if block.dec_ref() == 0 {
                    inner.blocks.remove(&block.index());
                }
            }
        }

        if let Some(errno) = first_err {
            return Err(FileError::Remote {
                source: io::Error::from_raw_os_error(-errno),
            });
        }

        Ok(copied)
    }

    /// Vectored read: services each `(offset, buf)` pair through [`File::read`].
    pub fn readv(self: &Arc<Self>, io_id: IoId, iovecs: &mut [(u64, &mut [u8])]) -> Result<usize, FileError> {
        let mut total = 0;
        for (offset, buf) in iovecs.iter_mut() {
            let len = buf.len() as u64;
            total += self.read(io_id, buf, *offset, len)?;
        }
        Ok(total)
    }

    fn fill_from_disk(&self, block: &Block) -> io::Result<()> {
        let fd = self.data_fd.lock();
        let mut tmp = vec![0u8; block.size()];
        let n = fd.read_at(&mut tmp, block.offset())?;
        let file_size = self.file_size().max(0) as u64;
        if n < tmp.len() && block.offset() + n as u64 != file_size {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short disk read"));
        }
        block.fill(&tmp[..n]);
        Ok(())
    }

    /// Verifies `block`'s already-filled bytes against any page CRCs cinfo
    /// already has recorded and verified for its byte range, when
    /// `policy_gate` says the configured [`CkSumPolicy`] calls for checking
    /// on this data path (cache hit vs. remote fetch). Pages with nothing
    /// recorded yet (first fill, or a policy that doesn't persist CRCs) pass
    /// trivially -- there's nothing to compare against. On a mismatch the
    /// block's cksum-error counter is bumped and `false` is returned.
    fn verify_block_crcs(&self, block: &Block, policy_gate: impl Fn(CkSumPolicy) -> bool) -> bool {
        let inner = self.inner.lock();
        if !policy_gate(inner.info.cksum_policy()) {
            return true;
        }
        let first_page = (block.offset() / cksum::PAGE_SIZE) as usize;
        let n = cksum::cs_num(block.offset(), block.size() as u64);
        let mut expected = Vec::with_capacity(n);
        for i in 0..n {
            if !inner.info.is_page_verified(first_page + i) {
                return true;
            }
            expected.push(inner.info.crc_for_page(first_page + i).unwrap_or(0));
        }
        drop(inner);
        match cksum::cs_ver(block.data(), 0, block.offset(), block.size() as u64, &expected) {
            Ok((0, _)) => true,
            _ => {
                block.record_cksum_error();
                false
            }
        }
    }

    /// Computes and records `block`'s per-page CRC32C values into cinfo
    /// (when the configured policy persists them), first checking them
    /// against any value already recorded and verified for the same page --
    /// a mismatch there means the page that's about to be (re)written
    /// disagrees with what was durably recorded for it before. Called from
    /// [`File::perform_write`] once a block has been positionally written to
    /// the data file. Returns `false` on a mismatch.
    fn record_and_verify_block_crcs(&self, inner: &mut FileInner, block: &Block) -> bool {
        if !inner.info.cksum_policy().persists_crc() {
            return true;
        }
        let mut crcs = Vec::new();
        cksum::cs_calc(block.data(), 0, block.offset(), block.size() as u64, &mut crcs);
        let first_page = (block.offset() / cksum::PAGE_SIZE) as usize;
        for (i, crc) in crcs.iter().enumerate() {
            let page = first_page + i;
            if inner.info.is_page_verified(page) {
                if inner.info.crc_for_page(page) != Some(*crc) {
                    block.record_cksum_error();
                    return false;
                }
            } else {
                inner.info.set_crc_for_page(page, *crc);
            }
        }
        block.set_crc_vector(crcs);
        true
    }

    fn healthy_io_excluding(&self, exclude: IoId) -> Option<(IoId, Arc<dyn RemoteSource>)> {
        let inner = self.inner.lock();
        inner
            .ios
            .iter()
            .find(|(id, (source, _))| **id != exclude && source.is_healthy())
            .map(|(id, (source, _))| (*id, source.clone()))
    }

    // ---- Write-back path ----------------------------------------------------

    /// Persists a downloaded block to the data file and marks its bit in the
    /// bitmap, flushing cinfo to disk every `flush_threshold` writes. Called
    /// by [`write_queue::ThreadPoolWriteQueue`] workers; a best-effort no-op
    /// once the file is in emergency shutdown.
    pub fn perform_write(&self, block: &Block) -> Result<(), FileError> {
        if self.is_shutdown() {
            return Ok(());
        }
        if !block.is_ok() {
            return Ok(());
        }

        {
            let fd = self.data_fd.lock();
            fd.write_at(block.data(), block.offset())
                .map_err(|source| FileError::Persist { source })?;
        }

        let mut inner = self.inner.lock();
        if !self.record_and_verify_block_crcs(&mut inner, block) {
            drop(inner);
            warn!(lfn = %self.lfn, block = block.index(), "page checksum mismatch persisting block");
            self.emergency_shutdown();
            return Err(FileError::ChecksumMismatch { block_index: block.index() });
        }
        inner.info.set_bit_written(block.index() as usize);
        inner.stats.bytes_written += block.size() as u64;
        inner.non_flushed += 1;
        inner.unsynced_writes = true;
        if inner.info.is_complete() {
            inner.prefetch_state = inner.prefetch_state.on_bitmap_complete();
        }

        let should_flush = inner.non_flushed >= self.config.flush_threshold;
        if should_flush {
            self.persist_cinfo_locked(&mut inner)?;
            inner.non_flushed = 0;
            inner.unsynced_writes = false;
        }
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    /// Drains accumulated hit/miss/write byte counters without waiting for
    /// a detach, for the resource monitor's periodic snapshot.
    pub fn take_stats_delta(&self) -> StatsDelta {
        self.inner.lock().stats.take()
    }

    // ---- Prefetch --------------------------------------------------------

    /// Issues a fetch for one missing block, on behalf of the prefetch
    /// coordinator. Picks the lowest-indexed block not yet on disk or
    /// already in flight, and an attached IO that currently allows
    /// prefetching and has spare budget under `config.prefetch.max_blocks`.
    /// Returns `false` if there is nothing to do right now (file complete,
    /// prefetch not active, or every eligible IO already at budget).
    pub fn prefetch_one(self: &Arc<Self>) -> bool {
        if self.is_shutdown() {
            return false;
        }

        let block_size = self.config.block_size;
        let file_size = self.file_size();

        let (io_id, source, idx, block) = {
            let mut inner = self.inner.lock();
            if !inner.prefetch_state.is_active() {
                return false;
            }

            let num_blocks = inner.info.num_blocks() as u64;
            let Some(idx) = (0..num_blocks).find(|&idx| !inner.info.test_bit_written(idx as usize) && !inner.blocks.contains_key(&idx)) else {
                return false;
            };

            let max_blocks = self.config.prefetch.max_blocks;
            let Some((io_id, source)) = inner.ios.iter_mut().find_map(|(id, (source, state))| {
                (state.allow_prefetching && source.is_healthy() && state.active_prefetch_count < max_blocks).then(|| {
                    state.active_prefetch_count += 1;
                    (*id, source.clone())
                })
            }) else {
                return false;
            };

            let block_offset = idx * block_size;
            let block_len = block_size.min((file_size as u64).saturating_sub(block_offset)) as usize;
            let block = Arc::new(Block::new(idx, block_offset, block_len, block_len, true, false));
            block.set_last_io(io_id);
            inner.blocks.insert(idx, block.clone());
            (io_id, source, idx, block)
        };

        let file = Arc::clone(self);
        std::thread::spawn(move || {
            fetch_block(Arc::clone(&file), block, io_id, source);
            let mut inner = file.inner.lock();
            if let Some((_, state)) = inner.ios.get_mut(&io_id) {
                state.active_prefetch_count = state.active_prefetch_count.saturating_sub(1);
            }
            if let Some(b) = inner.blocks.get(&idx) {
                if b.dec_ref() == 0 {
                    inner.blocks.remove(&idx);
                }
            }
        });
        true
    }
}

/// Fetches one missing block from `source`, retrying once against a
/// different healthy IO attached to `file` on failure, then queues the
/// filled block for write-back.
fn fetch_block(file: Arc<File>, block: Arc<Block>, primary_io: IoId, primary_source: Arc<dyn RemoteSource>) {
    let mut io_id = primary_io;
    let mut source = primary_source;

    loop {
        let mut buf = vec![0u8; block.size()];
        match source.read_at(block.offset(), &mut buf) {
            Ok(n) => {
                let file_size = file.file_size().max(0) as u64;
                let expected_eof = block.offset() + n as u64 == file_size;
                if n < buf.len() && !expected_eof {
                    block.set_error(-eio());
                } else {
                    block.fill(&buf[..n]);
                    if file.verify_block_crcs(&block, |p| matches!(p, CkSumPolicy::Net | CkSumPolicy::Both)) {
                        block.set_downloaded();
                        file.write_sink.submit(WriteTask {
                            file: Arc::clone(&file),
                            block: Arc::clone(&block),
                        });
                    } else {
                        warn!(lfn = %file.lfn, block = block.index(), "page checksum mismatch on remote fetch");
                        file.emergency_shutdown();
                        block.set_error(-eio());
                    }
                }
                break;
            }
            Err(e) => {
                if let Some((next_id, next_source)) = file.healthy_io_excluding(io_id) {
                    warn!(lfn = %file.lfn, block = block.index(), error = %e, "fetch failed, retrying on a different IO");
                    block.reset_error_and_set_io(next_id);
                    io_id = next_id;
                    source = next_source;
                    continue;
                }
                block.set_error(-(e.raw_os_error().unwrap_or(eio())));
                break;
            }
        }
    }

    file.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{io_binding::test_support::FakeRemote, write_queue::test_support::InlineWriteSink, *};
    use crate::oss::StdOss;

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        Arc::new(
            Config::builder(dir)
                .block_size(16)
                .flush_threshold(1)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn reconcile_cksum_policy_downgrades_in_place() {
        let info = Info::create(64, 16, CkSumPolicy::Cache, 8, 1_000);
        let reconciled = File::reconcile_cksum_policy(info, CkSumPolicy::None, std::time::Duration::from_secs(3600), 8, 1_500, "a.dat");
        assert_eq!(reconciled.cksum_policy(), CkSumPolicy::None);
        assert_eq!(reconciled.created_at(), 1_000);
    }

    #[test]
    fn reconcile_cksum_policy_resets_when_upgrade_requested_within_uvkeep() {
        let info = Info::create(64, 16, CkSumPolicy::None, 8, 1_000);
        let reconciled = File::reconcile_cksum_policy(info, CkSumPolicy::Cache, std::time::Duration::from_secs(100), 8, 1_050, "a.dat");
        assert_eq!(reconciled.cksum_policy(), CkSumPolicy::Cache);
        assert_eq!(reconciled.created_at(), 1_050);
    }

    #[test]
    fn reconcile_cksum_policy_upgrades_in_place_once_uvkeep_elapsed() {
        let info = Info::create(64, 16, CkSumPolicy::None, 8, 1_000);
        let reconciled = File::reconcile_cksum_policy(info, CkSumPolicy::Cache, std::time::Duration::from_secs(100), 8, 1_200, "a.dat");
        assert_eq!(reconciled.cksum_policy(), CkSumPolicy::Cache);
        assert_eq!(reconciled.created_at(), 1_000);
    }

    #[test]
    fn read_hits_after_full_prefetch_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data = (0u8..64).collect::<Vec<u8>>();
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("a/b.dat", data.len() as i64, config, Arc::new(StdOss), write_sink).unwrap();

        let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(1, data.clone()));
        file.add_io(remote, true);

        let mut buf = vec![0u8; 64];
        let n = file.read(1, &mut buf, 0, 64).unwrap();
        assert_eq!(n, 64);
        assert_eq!(buf, data);
        assert!(file.is_complete());

        // Second read should be served as a disk hit without any remote IO.
        let mut buf2 = vec![0u8; 20];
        let n2 = file.read(1, &mut buf2, 10, 20).unwrap();
        assert_eq!(n2, 20);
        assert_eq!(buf2, data[10..30]);
    }

    #[test]
    fn read_reports_remote_failure_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("c.dat", 32, config, Arc::new(StdOss), write_sink).unwrap();

        let remote = Arc::new(FakeRemote::new(7, vec![0u8; 32]));
        remote.set_fail_reads(true);
        let remote: Arc<dyn RemoteSource> = remote;
        file.add_io(remote, true);

        let mut buf = vec![0u8; 32];
        let err = file.read(7, &mut buf, 0, 32).unwrap_err();
        assert!(matches!(err, FileError::Remote { .. }));
    }

    #[test]
    fn emergency_shutdown_fails_subsequent_reads() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("d.dat", 16, config, Arc::new(StdOss), write_sink).unwrap();
        file.emergency_shutdown();

        let mut buf = vec![0u8; 16];
        let err = file.read(1, &mut buf, 0, 16).unwrap_err();
        assert!(matches!(err, FileError::ShutDown));
    }

    #[test]
    fn prefetch_one_declines_when_no_io_allows_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("f.dat", 16, config, Arc::new(StdOss), write_sink).unwrap();

        let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        file.add_io(remote, false);
        assert!(!file.prefetch_one());
    }

    #[test]
    fn prefetch_one_fetches_and_persists_a_missing_block() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data = (0u8..16).collect::<Vec<u8>>();
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("g.dat", data.len() as i64, config, Arc::new(StdOss), write_sink).unwrap();

        let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(1, data.clone()));
        file.add_io(remote, true);
        assert!(file.prefetch_one());

        for _ in 0..200 {
            if file.is_complete() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(file.is_complete());
    }

    #[test]
    fn cache_hit_checksum_mismatch_triggers_emergency_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            Config::builder(dir.path())
                .block_size(16)
                .flush_threshold(1)
                .cksum_policy(CkSumPolicy::Both, std::time::Duration::from_secs(3600))
                .build()
                .unwrap(),
        );
        let data = (0u8..16).collect::<Vec<u8>>();
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("h.dat", data.len() as i64, config, Arc::new(StdOss), write_sink).unwrap();

        let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(1, data.clone()));
        file.add_io(remote, true);

        let mut buf = vec![0u8; 16];
        assert_eq!(file.read(1, &mut buf, 0, 16).unwrap(), 16);
        assert!(file.is_complete());
        assert!(!file.is_shutdown());

        // Corrupt the data already recorded and verified on disk, bypassing
        // the cache entirely, so the next read is served as a disk hit whose
        // bytes disagree with the page CRC already stored for this block.
        std::fs::write(file.data_path(), vec![0xFFu8; 16]).unwrap();

        let mut buf2 = vec![0u8; 16];
        let err = file.read(1, &mut buf2, 0, 16).unwrap_err();
        assert!(matches!(err, FileError::ShutDown));
        assert!(file.is_shutdown());
    }

    #[test]
    fn write_task_keeps_block_alive_past_caller_release_for_deferred_persist() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data = (0u8..16).collect::<Vec<u8>>();
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("i.dat", data.len() as i64, config, Arc::new(StdOss), write_sink).unwrap();

        let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(1, data.clone()));
        file.add_io(remote, true);
        assert!(file.prefetch_one());

        for _ in 0..200 {
            if file.is_complete() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(file.is_complete());

        // The fetched block has long been released from `inner.blocks` by
        // the time its `WriteTask` reaches a writer thread under a real
        // ThreadPoolWriteQueue; since the task owns the block's `Arc`
        // directly rather than looking it up by index, the write still
        // lands even though nothing else references the block anymore.
        let on_disk = std::fs::read(file.data_path()).unwrap();
        assert_eq!(on_disk, data);
    }

    #[test]
    fn detach_closes_access_record_and_requires_final_sync() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let write_sink: Arc<dyn WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("e.dat", 16, config, Arc::new(StdOss), write_sink).unwrap();

        let remote: Arc<dyn RemoteSource> = Arc::new(FakeRemote::new(3, vec![0u8; 16]));
        file.add_io(remote, true);
        assert!(file.detach(3).is_some());
        assert!(file.finalize_sync_before_exit().is_ok());
    }
}
