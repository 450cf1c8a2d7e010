//! Per-IO attachment bookkeeping and the interface a [`super::File`] uses to
//! fetch missing blocks from whichever remote source an attached IO
//! represents.
//!
//! Modeled as a narrow interface rather than deep inheritance: a `Block`
//! keeps a stable back-reference to "which IO last
//! attempted me" ([`crate::block::Block::last_io`]), and a `File` can
//! enumerate its currently-healthy IOs to pick a different one to retry a
//! failed fetch.

use std::io;

use crate::block::IoId;

/// A source of remote bytes bound to one attached IO object. The remote
/// protocol itself (framing, auth, retries at the wire level) is an
/// external collaborator; this trait is the narrow seam the cache engine
/// needs against it.
pub trait RemoteSource: Send + Sync {
    /// Stable identifier for this IO, echoed back via [`crate::block::Block::last_io`].
    fn id(&self) -> IoId;

    /// Human-readable location (e.g. "redirector:port"), used only for logging.
    fn location(&self) -> &str;

    /// `true` if this IO is still attached and able to service reads.
    fn is_healthy(&self) -> bool;

    /// Reads `buf.len()` bytes starting at `offset` in the remote file into
    /// `buf`. Short reads are treated as an error by the block-fill logic
    /// unless they land exactly at EOF.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Per-IO state tracked by a `File` for as long as that IO remains attached.
#[derive(Debug, Clone)]
pub struct IoAttachState {
    pub attach_time: i64,
    pub active_prefetch_count: usize,
    pub allow_prefetching: bool,
}

impl IoAttachState {
    pub fn new(attach_time: i64, allow_prefetching: bool) -> Self {
        Self {
            attach_time,
            active_prefetch_count: 0,
            allow_prefetching,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// An in-memory [`RemoteSource`] used by unit tests: serves bytes from a
    /// fixed buffer and can be toggled unhealthy / made to fail reads.
    pub struct FakeRemote {
        id: IoId,
        location: String,
        healthy: AtomicBool,
        fail_reads: AtomicBool,
        data: Vec<u8>,
    }

    impl FakeRemote {
        pub fn new(id: IoId, data: Vec<u8>) -> Self {
            Self {
                id,
                location: format!("fake-{id}"),
                healthy: AtomicBool::new(true),
                fail_reads: AtomicBool::new(false),
                data,
            }
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::Release);
        }

        pub fn set_fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::Release);
        }
    }

    impl RemoteSource for FakeRemote {
        fn id(&self) -> IoId {
            self.id
        }

        fn location(&self) -> &str {
            &self.location
        }

        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::Acquire)
        }

        fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_reads.load(Ordering::Acquire) {
                return Err(io::Error::other("fake remote read failure"));
            }
            let start = offset as usize;
            if start >= self.data.len() {
                return Ok(0);
            }
            let end = (start + buf.len()).min(self.data.len());
            let n = end - start;
            buf[..n].copy_from_slice(&self.data[start..end]);
            Ok(n)
        }
    }
}
