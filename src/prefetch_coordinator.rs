//! The prefetch coordinator: one background thread that round-robins over
//! every `File` with prefetching enabled, pulling in one missing block at a
//! time per candidate so no single file can starve the others of a turn.
//!
//! `File::prefetch_one` does the actual block selection and fetch dispatch;
//! this module only owns the candidate set (populated by
//! [`crate::cache::Cache::register_prefetch_file`]/`deregister_prefetch_file`)
//! and the loop that walks it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::file::File;

/// Sleep between rounds that found at least one block to fetch: long enough
/// to let the write queue and in-flight fetches drain before asking again.
const ACTIVE_INTERVAL: Duration = Duration::from_millis(20);

/// Sleep between rounds that found nothing to do across every candidate.
const IDLE_INTERVAL: Duration = Duration::from_millis(500);

pub struct PrefetchCoordinator {
    candidates: Mutex<HashMap<String, Arc<File>>>,
    wake: Condvar,
    wake_lock: Mutex<()>,
    shutdown: AtomicBool,
}

impl PrefetchCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            candidates: Mutex::new(HashMap::new()),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Adds `file` to the candidate set. A no-op if it's already registered.
    pub fn register(&self, file: Arc<File>) {
        self.candidates.lock().insert(file.lfn().to_string(), file);
        let _guard = self.wake_lock.lock();
        self.wake.notify_one();
    }

    pub fn deregister(&self, lfn: &str) {
        self.candidates.lock().remove(lfn);
    }

    pub fn is_registered(&self, lfn: &str) -> bool {
        self.candidates.lock().contains_key(lfn)
    }

    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("pfc-prefetch".to_string())
            .spawn(move || this.run())
            .expect("failed to spawn pfc-prefetch thread")
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.wake_lock.lock();
        self.wake.notify_one();
    }

    /// Runs one round across every current candidate, returning `true` if
    /// any candidate had a block fetched. Files that have gone complete (or
    /// otherwise stopped prefetching) are dropped from the candidate set so
    /// future rounds don't keep probing them for nothing.
    pub fn round(&self) -> bool {
        let snapshot: Vec<Arc<File>> = self.candidates.lock().values().cloned().collect();
        let mut any = false;
        for file in snapshot {
            if file.prefetch_one() {
                any = true;
            } else if file.is_complete() || file.is_shutdown() {
                self.deregister(file.lfn());
            }
        }
        any
    }

    fn run(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let did_work = self.round();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let interval = if did_work { ACTIVE_INTERVAL } else { IDLE_INTERVAL };
            let mut guard = self.wake_lock.lock();
            self.wake.wait_for(&mut guard, interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{config::Config, file::io_binding::test_support::FakeRemote, file::write_queue::test_support::InlineWriteSink, oss::StdOss};

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        Arc::new(Config::builder(dir).block_size(16).flush_threshold(1).build().unwrap())
    }

    #[test]
    fn round_fetches_until_registered_file_completes_then_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let data = (0u8..64).collect::<Vec<u8>>();
        let write_sink: Arc<dyn crate::file::WriteSink> = Arc::new(InlineWriteSink);
        let file = File::open("a.dat", data.len() as i64, config, Arc::new(StdOss), write_sink).unwrap();
        file.add_io(Arc::new(FakeRemote::new(1, data)), true);

        let coordinator = PrefetchCoordinator::new();
        coordinator.register(file.clone());
        assert!(coordinator.is_registered("a.dat"));

        // Each round dispatches at most one new block; keep rounding until
        // the 64-byte, 4-block file is complete or we give up.
        for _ in 0..200 {
            if file.is_complete() {
                break;
            }
            coordinator.round();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(file.is_complete());

        coordinator.round();
        assert!(!coordinator.is_registered("a.dat"));
    }

    #[test]
    fn round_is_a_noop_with_no_candidates() {
        let coordinator = PrefetchCoordinator::new();
        assert!(!coordinator.round());
    }
}
