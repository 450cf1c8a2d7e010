//! Bounded write-task thread pool.
//!
//! Downloaded blocks are hashed off to a small pool of writer threads that
//! perform the positional write into the owning file's data descriptor,
//! update the bitmap, and periodically `fsync` the cinfo file. The queue is
//! bounded: when saturated, blocks stay referenced (elevated refcount)
//! rather than being dropped, which naturally back-pressures further
//! prefetching.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::File;
use crate::block::Block;

/// One unit of work for a writer thread: persist `block` of `file` to disk.
///
/// The task owns the block's `Arc` rather than carrying just its index: a
/// block's refcount is a reader count dropped to zero (and the block
/// evicted from `File`'s block map) as soon as the caller that faulted it in
/// has copied its bytes out, which can race ahead of an async write-task
/// pool actually performing the write. Keeping the `Arc` here means the
/// block stays alive for `perform_write` regardless of how fast the block
/// map forgets about it.
pub struct WriteTask {
    pub file: Arc<File>,
    pub block: Arc<Block>,
}

/// Sink for write tasks. [`crate::cache::Cache`] owns the production
/// implementation ([`ThreadPoolWriteQueue`]); this trait lets `File` submit
/// work without depending on `Cache` directly.
pub trait WriteSink: Send + Sync {
    fn submit(&self, task: WriteTask);
}

/// A bounded channel plus a fixed pool of worker threads draining it.
pub struct ThreadPoolWriteQueue {
    sender: Sender<WriteTask>,
    _workers: Vec<std::thread::JoinHandle<()>>,
}

impl ThreadPoolWriteQueue {
    pub fn new(threads: usize, max_queued: usize) -> Arc<Self> {
        let (sender, receiver): (Sender<WriteTask>, Receiver<WriteTask>) = bounded(max_queued.max(1));
        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads.max(1) {
            let receiver = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("pfc-writer-{worker_id}"))
                    .spawn(move || {
                        while let Ok(task) = receiver.recv() {
                            let block_index = task.block.index();
                            if let Err(e) = task.file.perform_write(&task.block) {
                                warn!(error = %e, block = block_index, "write-task failed");
                            }
                        }
                    })
                    .expect("failed to spawn pfc writer thread"),
            );
        }
        Arc::new(Self {
            sender,
            _workers: workers,
        })
    }
}

impl WriteSink for ThreadPoolWriteQueue {
    fn submit(&self, task: WriteTask) {
        // A bounded channel send blocks the caller (a fetch thread) when
        // saturated, which is exactly the backpressure we want.
        if self.sender.send(task).is_err() {
            warn!("write queue receiver dropped; cache is shutting down");
        }
    }
}
