//! The cache singleton: owns the LFN→[`crate::file::File`] table, the
//! shared write-task thread pool, and the configuration every subsystem
//! reads from.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex};
use snafu::Snafu;

use crate::{
    config::Config,
    file::{File, FileError, WriteSink},
    oss::{Oss, OssError},
    prefetch_coordinator::PrefetchCoordinator,
    resource_monitor::{AccessToken, AccessTokenTable, Event, EventQueues},
};

#[derive(Debug, Snafu)]
pub enum CacheError {
    #[snafu(display("storage error: {}", source))]
    Storage { source: OssError },

    #[snafu(display("file error: {}", source))]
    File { source: FileError },

    #[snafu(display("file is shutting down for lfn {}", lfn))]
    Torndown { lfn: String },
}

impl From<OssError> for CacheError {
    fn from(source: OssError) -> Self {
        CacheError::Storage { source }
    }
}

impl From<FileError> for CacheError {
    fn from(source: FileError) -> Self {
        CacheError::File { source }
    }
}

/// One entry in the file table: either a live `File`, or a placeholder
/// while one is under construction or teardown elsewhere (may be absent
/// transiently between the two).
enum Slot {
    Building,
    Ready(Arc<File>, AccessToken),
}

struct Table {
    entries: HashMap<String, Slot>,
    /// Protects against racing `Unlink` while a file is active or in the
    /// process of being (re)built; consulted by the purge path.
    purge_protected: std::collections::HashSet<String>,
}

/// Singleton cache engine. Construct one per process (or per test) and
/// share it behind an `Arc`; there is no global/`static` instance, so tests
/// get full isolation from each other.
pub struct Cache {
    config: Arc<Config>,
    oss: Arc<dyn Oss>,
    write_queue: Arc<dyn WriteSink>,
    table: Mutex<Table>,
    cond: Condvar,
    next_io_id: AtomicU64,
    events: Arc<EventQueues>,
    tokens: Arc<Mutex<AccessTokenTable>>,
    now_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
    prefetch: Arc<PrefetchCoordinator>,
}

fn default_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Cache {
    pub fn new(config: Config, oss: Arc<dyn Oss>) -> Arc<Self> {
        let config = Arc::new(config);
        let write_queue = crate::file::write_queue::ThreadPoolWriteQueue::new(
            config.write_queue.threads,
            config.write_queue.max_blocks,
        );
        Self::with_write_queue(config, oss, write_queue)
    }

    /// Constructs a `Cache` with an explicit write sink, for tests that want
    /// to observe or short-circuit block persistence.
    pub fn with_write_queue(config: Arc<Config>, oss: Arc<dyn Oss>, write_queue: Arc<dyn WriteSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            oss,
            write_queue,
            table: Mutex::new(Table {
                entries: HashMap::new(),
                purge_protected: std::collections::HashSet::new(),
            }),
            cond: Condvar::new(),
            next_io_id: AtomicU64::new(1),
            events: Arc::new(EventQueues::new()),
            tokens: Arc::new(Mutex::new(AccessTokenTable::new())),
            now_fn: Arc::new(default_now),
            prefetch: PrefetchCoordinator::new(),
        })
    }

    /// Spawns the prefetch coordinator's background thread. The cache is
    /// fully usable without calling this (prefetch registration is still
    /// tracked, just never drained), which is how tests that don't care
    /// about prefetch timing keep their threads to a minimum.
    pub fn start_prefetch_coordinator(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        self.prefetch.start()
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn oss(&self) -> &Arc<dyn Oss> {
        &self.oss
    }

    /// The event queue fed by this cache's open/close/unlink paths. Shared
    /// with a [`crate::resource_monitor::ResourceMonitor`] constructed over
    /// the same cache so its heartbeat can drain and replay them.
    pub fn events(&self) -> &Arc<EventQueues> {
        &self.events
    }

    /// The token table this cache allocates `Open` events' [`AccessToken`]s
    /// from. Shared with a [`crate::resource_monitor::ResourceMonitor`]
    /// constructed over the same cache, so the token a `Close` event's
    /// replay clears is the same table entry the matching `Open` allocated.
    pub fn tokens(&self) -> &Arc<Mutex<AccessTokenTable>> {
        &self.tokens
    }

    fn alloc_io_id(&self) -> u64 {
        self.next_io_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Gets (opening if necessary) the `File` for `lfn`, attaches a new IO
    /// to it, and returns both the file and the IO id just attached.
    /// Blocks while the entry is in the `Building` transient state for
    /// another caller, then joins it.
    pub fn get_file(
        &self,
        lfn: &str,
        file_size: i64,
        remote: Arc<dyn crate::file::RemoteSource>,
        allow_prefetching: bool,
    ) -> Result<(Arc<File>, u64), CacheError> {
        let io_id = self.alloc_io_id();

        loop {
            {
                let mut table = self.table.lock();
                match table.entries.get(lfn) {
                    Some(Slot::Ready(file, _token)) => {
                        let file = file.clone();
                        drop(table);
                        file.add_io(remote, allow_prefetching);
                        self.maybe_register_prefetch(&file, allow_prefetching);
                        return Ok((file, io_id));
                    }
                    Some(Slot::Building) => {
                        self.cond.wait(&mut table);
                        continue;
                    }
                    None => {
                        table.entries.insert(lfn.to_string(), Slot::Building);
                    }
                }
            }

            let result = File::open(lfn, file_size, self.config.clone(), self.oss.clone(), self.write_queue.clone());

            let mut table = self.table.lock();
            match &result {
                Ok(file) => {
                    let token = self.tokens.lock().alloc(lfn);
                    self.events.push(Event::Open {
                        lfn: lfn.to_string(),
                        token,
                        now: (self.now_fn)(),
                    });
                    crate::internal_events::file_opened();
                    table.entries.insert(lfn.to_string(), Slot::Ready(file.clone(), token));
                }
                Err(_) => {
                    table.entries.remove(lfn);
                }
            }
            drop(table);
            self.cond.notify_all();

            let file = result?;
            file.add_io(remote, allow_prefetching);
            self.maybe_register_prefetch(&file, allow_prefetching);
            return Ok((file, io_id));
        }
    }

    /// Registers `file` with the prefetch coordinator when prefetching is
    /// both globally enabled and requested by this IO, and the file isn't
    /// already fully downloaded.
    fn maybe_register_prefetch(&self, file: &Arc<File>, allow_prefetching: bool) {
        if self.config.prefetch.enabled && allow_prefetching && !file.is_complete() {
            self.register_prefetch_file(file);
        }
    }

    /// Detaches `io_id` from `file`. If this was the last attached IO and no
    /// pending prefetch activity remains, schedules a final cinfo sync; the
    /// file entry itself is kept in the table (so a subsequent `get_file`
    /// for the same LFN reuses it) unless `unlink` is called separately.
    pub fn release_file(&self, file: &Arc<File>, io_id: u64) -> Result<(), CacheError> {
        if file.io_active(io_id) {
            return Ok(());
        }
        if let Some((now, delta)) = file.detach(io_id) {
            let token = match self.table.lock().entries.get(file.lfn()) {
                Some(Slot::Ready(_, token)) => Some(*token),
                _ => None,
            };
            if let Some(token) = token {
                self.events.push(Event::Close {
                    lfn: file.lfn().to_string(),
                    token,
                    now,
                    delta,
                });
            }
            crate::internal_events::file_closed();
            crate::internal_events::read_bytes(delta.bytes_hit, delta.bytes_missed);
            self.deregister_prefetch_file(file.lfn());
            file.finalize_sync_before_exit()?;
        }
        Ok(())
    }

    /// Samples and clears every open file's accumulated stats delta, pushing
    /// a [`Event::StatUpdate`] for any that changed since the last sample.
    /// Called by [`crate::resource_monitor::ResourceMonitor`]'s heartbeat,
    /// since only the cache's table can enumerate the currently-open files.
    pub fn sample_stats_into_events(&self) {
        let files: Vec<Arc<File>> = {
            let table = self.table.lock();
            table
                .entries
                .values()
                .filter_map(|slot| match slot {
                    Slot::Ready(file, _) => Some(file.clone()),
                    Slot::Building => None,
                })
                .collect()
        };
        for file in files {
            let delta = file.take_stats_delta();
            if !delta.is_zero() {
                self.events.push(Event::StatUpdate {
                    lfn: file.lfn().to_string(),
                    delta,
                });
            }
        }
    }

    /// `true` if `lfn` has a `File` with at least one attached IO, is mid
    /// construction/teardown, or has been explicitly marked purge-protected.
    /// A `File` can sit `Ready` in the table with zero attached IOs (kept
    /// around so the next `get_file` reuses it) without that alone
    /// protecting it from purge. Consulted by the purge candidate walk.
    pub fn is_file_active_or_purge_protected(&self, lfn: &str) -> bool {
        let table = self.table.lock();
        match table.entries.get(lfn) {
            Some(Slot::Ready(file, _)) => file.io_count() > 0,
            Some(Slot::Building) => true,
            None => false,
        }
        || table.purge_protected.contains(lfn)
    }

    /// Adds `file` to the prefetch coordinator's candidate set and marks it
    /// purge-protected for as long as it stays registered, so the
    /// coordinator never finds its blocks deleted out from under it mid-fetch.
    pub fn register_prefetch_file(&self, file: &Arc<File>) {
        self.table.lock().purge_protected.insert(file.lfn().to_string());
        self.prefetch.register(file.clone());
    }

    pub fn deregister_prefetch_file(&self, lfn: &str) {
        self.prefetch.deregister(lfn);
        self.table.lock().purge_protected.remove(lfn);
    }

    /// Emergency-shuts-down `lfn`'s File (if open), then removes its data
    /// and cinfo from disk. Cross-checks with any active File first so a
    /// concurrent reader observes `-ENOENT` rather than a half-deleted pair.
    pub fn unlink(&self, lfn: &str) -> Result<(), CacheError> {
        let file = {
            let table = self.table.lock();
            match table.entries.get(lfn) {
                Some(Slot::Ready(file, _)) => Some(file.clone()),
                _ => None,
            }
        };
        if let Some(file) = &file {
            file.emergency_shutdown();
        }
        self.deregister_prefetch_file(lfn);

        let (data_path, cinfo_path) = match &file {
            Some(file) => (file.data_path().to_path_buf(), file.cinfo_path().to_path_buf()),
            None => File::resolve_paths(&self.config, lfn),
        };

        let size_hint = self.oss.allocated_blocks(&data_path)?.map(|blocks| blocks * 512).unwrap_or(0);

        self.oss.unlink(&cinfo_path)?;
        self.oss.unlink(&data_path)?;

        let mut table = self.table.lock();
        table.entries.remove(lfn);
        table.purge_protected.remove(lfn);
        drop(table);

        self.events.push(Event::Purge {
            lfn: lfn.to_string(),
            bytes_freed: size_hint,
            now: (self.now_fn)(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::io_binding::test_support::FakeRemote;

    fn test_cache(dir: &std::path::Path) -> Arc<Cache> {
        let config = Config::builder(dir).block_size(16).flush_threshold(1).build().unwrap();
        Cache::new(config, Arc::new(crate::oss::StdOss))
    }

    #[test]
    fn get_file_joins_existing_entry_on_second_attach() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let remote1: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        let remote2: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(2, vec![0u8; 16]));

        let (file1, io1) = cache.get_file("x.dat", 16, remote1, true).unwrap();
        let (file2, io2) = cache.get_file("x.dat", 16, remote2, true).unwrap();

        assert!(Arc::ptr_eq(&file1, &file2));
        assert_eq!(file1.io_count(), 2);
        assert_ne!(io1, io2);
    }

    #[test]
    fn unlink_removes_data_and_cinfo() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let remote: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        let (file, _io) = cache.get_file("y.dat", 16, remote, true).unwrap();
        let data_path = file.data_path().to_path_buf();
        let cinfo_path = file.cinfo_path().to_path_buf();
        drop(file);

        cache.unlink("y.dat").unwrap();
        assert!(!data_path.exists());
        assert!(!cinfo_path.exists());
        assert!(!cache.is_file_active_or_purge_protected("y.dat"));
    }

    #[test]
    fn release_file_finalizes_sync_on_last_detach() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let remote: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(9, vec![0u8; 16]));
        let (file, io_id) = cache.get_file("z.dat", 16, remote, true).unwrap();
        cache.release_file(&file, io_id).unwrap();
        assert_eq!(file.io_count(), 0);
    }

    #[test]
    fn get_file_emits_open_event_only_on_first_build() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let remote1: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        let remote2: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(2, vec![0u8; 16]));

        cache.get_file("open.dat", 16, remote1, true).unwrap();
        cache.get_file("open.dat", 16, remote2, true).unwrap();

        let drained = cache.events().drain();
        assert_eq!(drained.opens.len(), 1);
        assert_eq!(drained.opens[0].0, "open.dat");
    }

    #[test]
    fn release_file_emits_close_event_with_matching_token() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let remote: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        let (file, io_id) = cache.get_file("close.dat", 16, remote, true).unwrap();

        let opened = cache.events().drain();
        let open_token = opened.opens[0].1;

        cache.release_file(&file, io_id).unwrap();
        let closed = cache.events().drain();
        assert_eq!(closed.closes.len(), 1);
        assert_eq!(closed.closes[0].0, "close.dat");
        assert_eq!(closed.closes[0].1, open_token);
    }

    #[test]
    fn unlink_emits_purge_event() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let remote: Arc<dyn crate::file::RemoteSource> = Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        let (file, _io) = cache.get_file("purge.dat", 16, remote, true).unwrap();
        drop(file);
        cache.events().drain();

        cache.unlink("purge.dat").unwrap();
        let drained = cache.events().drain();
        assert_eq!(drained.purges.len(), 1);
        assert_eq!(drained.purges[0].0, "purge.dat");
    }
}
