//! End-to-end scenarios exercising `Cache`, `DirState`, `ResourceMonitor`,
//! and the purge pass together through the public API.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use pfc::{
    cache::Cache,
    dirstate::DirState,
    file::RemoteSource,
    oss::StdOss,
    resource_monitor::ResourceMonitor,
    Config,
};
use pretty_assertions::assert_eq;

/// Installs a `tracing` subscriber reading `RUST_LOG` the first time any
/// scenario test calls it, so a failing assertion can be re-run with logging
/// visible instead of adding `println!` debugging.
fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    });
}

/// An in-memory remote serving a fixed buffer, for tests run outside the
/// crate's own `#[cfg(test)]` module (which keeps its own `FakeRemote`).
struct FixedRemote {
    id: u64,
    data: Vec<u8>,
    fail: AtomicBool,
}

impl FixedRemote {
    fn new(id: u64, data: Vec<u8>) -> Self {
        Self { id, data, fail: AtomicBool::new(false) }
    }
}

impl RemoteSource for FixedRemote {
    fn id(&self) -> u64 {
        self.id
    }

    fn location(&self) -> &str {
        "test-remote"
    }

    fn is_healthy(&self) -> bool {
        !self.fail.load(Ordering::Relaxed)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "remote unavailable"));
        }
        let offset = offset as usize;
        let n = buf.len().min(self.data.len().saturating_sub(offset));
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

fn test_cache(dir: &std::path::Path) -> Arc<Cache> {
    let config = Config::builder(dir).block_size(64).flush_threshold(1).build().unwrap();
    Cache::new(config, Arc::new(StdOss))
}

/// Opening and reading a file, then releasing it, must flow all the way
/// through to the DirState tree once the resource monitor ticks: the open
/// count, close count, and hit bytes recorded under the file's directory
/// match what actually happened.
#[test]
fn open_read_close_flows_through_to_dirstate_on_tick() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cache = test_cache(dir.path());
    let dirstate = Arc::new(DirState::new());
    let monitor = ResourceMonitor::with_clock(cache.clone(), dirstate.clone(), Arc::new(|| 1_000_000));

    let data = (0u8..64).collect::<Vec<u8>>();
    let remote: Arc<dyn RemoteSource> = Arc::new(FixedRemote::new(1, data.clone()));
    let (file, io_id) = cache.get_file("a/b/hit.dat", 64, remote, true).unwrap();

    let mut buf = vec![0u8; 64];
    let n = file.read(io_id, &mut buf, 0, 64).unwrap();
    assert_eq!(n, 64);
    assert_eq!(buf, data);

    cache.release_file(&file, io_id).unwrap();
    drop(file);

    monitor.tick().unwrap();

    let usage = dirstate.here_usage_at("a/b").unwrap();
    assert_eq!(usage.n_files_opened, 1);
    assert_eq!(usage.n_files_closed, 1);
}

/// A file that is still open must never be selected by a purge pass, even
/// when the computed byte target would otherwise reclaim it: for every file
/// still resident, `is_file_active_or_purge_protected` must have held at
/// entry to the deletion step.
#[test]
fn purge_pass_skips_an_open_file_and_removes_an_idle_one() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cache = test_cache(dir.path());

    let keep_remote: Arc<dyn RemoteSource> = Arc::new(FixedRemote::new(1, vec![7u8; 64]));
    let (keep_file, keep_io) = cache.get_file("keep.dat", 64, keep_remote, true).unwrap();
    keep_file.read(keep_io, &mut [0u8; 64], 0, 64).unwrap();

    let idle_remote: Arc<dyn RemoteSource> = Arc::new(FixedRemote::new(2, vec![9u8; 64]));
    let (idle_file, idle_io) = cache.get_file("idle.dat", 64, idle_remote, true).unwrap();
    idle_file.read(idle_io, &mut [0u8; 64], 0, 64).unwrap();
    cache.release_file(&idle_file, idle_io).unwrap();
    drop(idle_file);

    let outcome = pfc::purge::run_pass(&cache, cache.events(), u64::MAX, None, 2_000_000).unwrap();

    assert_eq!(outcome.files_removed, 1);
    assert!(dir.path().join("keep.dat").exists());
    assert!(!dir.path().join("idle.dat").exists());

    cache.release_file(&keep_file, keep_io).unwrap();
}

/// With no watermarks configured (the permissive defaults: `w1=0`,
/// `w2=max`, `f0=0`), a tick against a real filesystem never computes a
/// purge target -- exercises `bytes_to_remove` end-to-end from a `Cache`'s
/// own `Oss::stat_vs`/`DirState` figures rather than hand-supplied numbers
/// (the exact watermark math is unit-tested in `purge.rs`).
#[test]
fn resource_monitor_tick_returns_zero_target_on_an_empty_cache() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cache = test_cache(dir.path());
    let dirstate = Arc::new(DirState::new());
    let monitor = ResourceMonitor::new(cache, dirstate);

    let outcome = monitor.tick().unwrap();
    assert_eq!(outcome.bytes_target, 0);
    assert_eq!(outcome.files_removed, 0);
}
