//! In-memory unit of transfer for one block index within a [`crate::file::File`].
//!
//! A block is single-writer, multiple-reader: the writer is whichever I/O
//! path (on-demand fault or prefetcher) filled it, and readers are threads
//! waiting on the owning file's condition variable for [`Block::is_finished`]
//! to become true. Ownership is exclusive to the `File` that created it; the
//! refcount here is a reader count for coordinated release, not a shared
//! ownership mechanism.

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicI32, AtomicUsize, Ordering},
};

use bytes::BytesMut;

/// Identifies which attached IO last attempted to fill a block, so that on
/// failure a different, still-healthy IO attached to the same file can
/// retry.
pub type IoId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Request issued, fetch in flight.
    Pending,
    /// Fetch completed successfully.
    Ok,
    /// Fetch failed; `errno` holds `-errno`.
    Failed,
}

/// A single block's in-memory buffer and state.
pub struct Block {
    index: u64,
    offset: u64,
    size: usize,
    request_size: usize,
    buffer: UnsafeCell<BytesMut>,
    refcount: AtomicUsize,
    errno: AtomicI32,
    downloaded: std::sync::atomic::AtomicBool,
    prefetch: std::sync::atomic::AtomicBool,
    cksum_requested: bool,
    crc_vector: parking_lot::Mutex<Vec<u32>>,
    cksum_error_count: AtomicUsize,
    last_io: parking_lot::Mutex<Option<IoId>>,
}

// `buffer` is only ever written by the single attempt currently filling
// this block and only ever read after that attempt publishes completion
// through `downloaded`/`errno` with `Release` ordering; see `data`/`fill`.
unsafe impl Sync for Block {}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl Block {
    /// Creates a new, empty block for `index`, covering `size` bytes at
    /// `offset` in the logical file. `request_size` may exceed `size` when
    /// the prefetcher coalesces this block with neighbors.
    pub fn new(index: u64, offset: u64, size: usize, request_size: usize, is_prefetch: bool, cksum_requested: bool) -> Self {
        Self {
            index,
            offset,
            size,
            request_size,
            buffer: UnsafeCell::new(BytesMut::zeroed(size)),
            refcount: AtomicUsize::new(1),
            errno: AtomicI32::new(0),
            downloaded: std::sync::atomic::AtomicBool::new(false),
            prefetch: std::sync::atomic::AtomicBool::new(is_prefetch),
            cksum_requested,
            crc_vector: parking_lot::Mutex::new(Vec::new()),
            cksum_error_count: AtomicUsize::new(0),
            last_io: parking_lot::Mutex::new(None),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn request_size(&self) -> usize {
        self.request_size
    }

    pub fn is_prefetch(&self) -> bool {
        self.prefetch.load(Ordering::Acquire)
    }

    pub fn is_cksum_requested(&self) -> bool {
        self.cksum_requested
    }

    /// Safe only because writes (via [`Block::fill`]) always happen-before
    /// the `Release` store in [`Block::set_downloaded`]/[`Block::set_error`],
    /// and every reader observes block completion through an `Acquire` load
    /// of that same state first (see [`Block::is_finished`]). Concurrent
    /// calls to `fill` on the same block never happen: a block is filled by
    /// exactly one fetch attempt at a time.
    pub fn data(&self) -> &[u8] {
        unsafe { &*self.buffer.get() }
    }

    /// Copies `data` into this block's buffer. Must only be called by the
    /// single fetch (or disk-read) attempt currently responsible for filling
    /// this block, before it is marked finished.
    pub fn fill(&self, data: &[u8]) {
        let buf = unsafe { &mut *self.buffer.get() };
        buf[..data.len()].copy_from_slice(data);
    }

    pub fn inc_ref(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reader count, returning the count after decrementing.
    pub fn dec_ref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_ok(&self) -> bool {
        self.downloaded.load(Ordering::Acquire) && self.errno.load(Ordering::Acquire) == 0
    }

    pub fn is_failed(&self) -> bool {
        self.errno.load(Ordering::Acquire) != 0
    }

    pub fn is_finished(&self) -> bool {
        self.is_ok() || self.is_failed()
    }

    pub fn state(&self) -> BlockState {
        if self.is_failed() {
            BlockState::Failed
        } else if self.downloaded.load(Ordering::Acquire) {
            BlockState::Ok
        } else {
            BlockState::Pending
        }
    }

    pub fn set_downloaded(&self) {
        self.downloaded.store(true, Ordering::Release);
    }

    pub fn set_error(&self, errno: i32) {
        debug_assert!(errno < 0, "errno must be stored as a negative value");
        self.errno.store(errno, Ordering::Release);
    }

    pub fn errno(&self) -> i32 {
        self.errno.load(Ordering::Acquire)
    }

    /// Clears any failure state and rebinds this block to a new IO, so a
    /// failed fetch can be reissued against a different attached source.
    pub fn reset_error_and_set_io(&self, io: IoId) {
        self.errno.store(0, Ordering::Release);
        self.downloaded.store(false, Ordering::Release);
        *self.last_io.lock() = Some(io);
    }

    pub fn set_last_io(&self, io: IoId) {
        *self.last_io.lock() = Some(io);
    }

    pub fn last_io(&self) -> Option<IoId> {
        *self.last_io.lock()
    }

    pub fn crc_vector(&self) -> Vec<u32> {
        self.crc_vector.lock().clone()
    }

    pub fn set_crc_vector(&self, v: Vec<u32>) {
        *self.crc_vector.lock() = v;
    }

    pub fn record_cksum_error(&self) -> usize {
        self.cksum_error_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn cksum_error_count(&self) -> usize {
        self.cksum_error_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_block_is_pending() {
        let b = Block::new(0, 0, 1024, 1024, false, false);
        assert_eq!(b.state(), BlockState::Pending);
        assert!(!b.is_finished());
    }

    #[test]
    fn set_downloaded_marks_ok() {
        let b = Block::new(0, 0, 1024, 1024, false, false);
        b.set_downloaded();
        assert!(b.is_ok());
        assert!(b.is_finished());
    }

    #[test]
    fn set_error_marks_failed_and_is_finished() {
        let b = Block::new(0, 0, 1024, 1024, false, false);
        b.set_error(-5);
        assert!(b.is_failed());
        assert!(b.is_finished());
        assert_eq!(b.errno(), -5);
    }

    #[test]
    fn reset_error_clears_failure_and_rebinds_io() {
        let b = Block::new(0, 0, 1024, 1024, false, false);
        b.set_error(-5);
        b.reset_error_and_set_io(42);
        assert!(!b.is_failed());
        assert!(!b.is_finished());
        assert_eq!(b.last_io(), Some(42));
    }

    #[test]
    fn refcount_tracks_readers() {
        let b = Block::new(0, 0, 1024, 1024, false, false);
        assert_eq!(b.ref_count(), 1);
        b.inc_ref();
        assert_eq!(b.ref_count(), 2);
        assert_eq!(b.dec_ref(), 1);
    }
}
