//! Purge: candidate selection and safe deletion.
//!
//! Two orthogonal triggers decide *how many bytes* should be reclaimed this
//! pass ([`bytes_to_remove`]); candidate selection and deletion then walk
//! the cache tree picking the least-recently-accessed files first, skipping
//! anything [`crate::cache::Cache::is_file_active_or_purge_protected`]
//! reports as in use, re-checking that guard immediately before each
//! deletion to close the race with a newly opened file.

use snafu::Snafu;

use crate::{
    cache::Cache,
    config::{Config, DiskUsageWatermarks, FileUsageThresholds},
    file::File,
    fs_traversal::FsTraversal,
    info::Info,
    oss::{OssError, StatVs},
    resource_monitor::EventQueues,
};

#[derive(Debug, Snafu)]
pub enum PurgeError {
    #[snafu(display("storage error: {}", source))]
    Storage { source: OssError },
}

impl From<OssError> for PurgeError {
    fn from(source: OssError) -> Self {
        PurgeError::Storage { source }
    }
}

/// Computes how many bytes should be removed this purge pass, per the
/// space-based trigger formulas below.
///
/// `disk` is the current disk usage for the data space; `cache_file_usage`
/// is `x` (the cache's own accounting of bytes on disk, e.g.
/// `DirState::recursive_usage_at_root().bytes_on_disk`); `delta_estimate`
/// is `δ`, an estimate of writes since the last check (see
/// [`crate::resource_monitor::ResourceMonitor`]'s own write-delta tracking,
/// fed from each `StatUpdate` event's `bytes_written`).
pub fn bytes_to_remove(
    disk: StatVs,
    cache_file_usage: u64,
    watermarks: DiskUsageWatermarks,
    thresholds: FileUsageThresholds,
    delta_estimate: u64,
) -> u64 {
    let w1 = watermarks.low as f64;
    let w2 = watermarks.high as f64;
    let f0 = thresholds.base as f64;
    let f1 = thresholds.nominal as f64;
    let f2 = thresholds.max as f64;
    let t = disk.total_bytes as f64;
    let u = disk.used_bytes as f64;
    let x = cache_file_usage as f64;
    let delta = delta_estimate as f64;

    let clamp = |v: f64, lo: f64, hi: f64| v.max(lo).min(hi.max(lo));

    if x < f0 {
        return 0;
    }

    if u >= w2 {
        if w2 >= t {
            return (u - w1).max(0.0).round() as u64;
        }
        let frac_u = (u - w2) / (t - w2);
        let frac_x = if f1 > f0 { (x - f0) / (f1 - f0) } else { 0.0 };
        let amount = if frac_x > frac_u {
            clamp((frac_x - frac_u) * (f1 - f0) + delta, f0, f1)
        } else {
            clamp(frac_u * (f2 - f0) + delta, f0, f2)
        };
        return amount.round() as u64;
    }

    if u > w1 && x > f1 {
        let frac_u = if w2 > w1 { (u - w1) / (w2 - w1) } else { 0.0 };
        let frac_x = if f2 > f1 { (x - f1) / (f2 - f1) } else { 0.0 };
        if frac_x > frac_u {
            return clamp((frac_x - frac_u) * (f2 - f1) + delta, f0, f2).round() as u64;
        }
        return 0;
    }

    if x > f2 {
        let target = (f2 - delta).max(f0);
        return (x - target).max(0.0).round() as u64;
    }

    0
}

/// One purge candidate: a cinfo+data pair not currently active or
/// protected, with the last-access time and on-disk size extracted from its
/// cinfo (or the data file's mtime, if the cinfo has no access log yet).
#[derive(Debug, Clone)]
pub struct Candidate {
    pub lfn: String,
    pub last_access: i64,
    pub size_bytes: u64,
}

/// Walks the whole cache tree from the traversal's current position,
/// gathering every paired (data, cinfo) entry that is not active or
/// purge-protected, sorted oldest-access-first.
pub fn collect_candidates(traversal: &mut FsTraversal, cache: &Cache, config: &Config, now: i64) -> Result<Vec<Candidate>, PurgeError> {
    let mut out = Vec::new();
    collect_recursive(traversal, cache, config, now, "", &mut out)?;
    out.sort_by_key(|c| c.last_access);
    Ok(out)
}

fn collect_recursive(
    traversal: &mut FsTraversal,
    cache: &Cache,
    config: &Config,
    now: i64,
    prefix: &str,
    out: &mut Vec<Candidate>,
) -> Result<(), PurgeError> {
    let entries: Vec<(String, crate::fs_traversal::PairedEntry)> = traversal.entries().map(|(k, v)| (k.to_string(), v)).collect();
    for (name, paired) in entries {
        if !paired.has_cinfo || !paired.has_data {
            continue;
        }
        let lfn = if prefix.is_empty() { name.clone() } else { format!("{prefix}/{name}") };
        if cache.is_file_active_or_purge_protected(&lfn) {
            continue;
        }
        match read_candidate_meta(traversal, &name, paired.stat_data, config) {
            Ok((last_access, size_bytes)) => out.push(Candidate { lfn, last_access, size_bytes }),
            Err(e) => warn!(lfn = %lfn, error = %e, "skipping unreadable cinfo during purge scan"),
        }
    }

    let subdirs = traversal.subdirs().to_vec();
    for dir in subdirs {
        traversal.cd_down(&dir)?;
        let child_prefix = if prefix.is_empty() { dir.clone() } else { format!("{prefix}/{dir}") };
        collect_recursive(traversal, cache, config, now, &child_prefix, out)?;
        traversal.cd_up();
    }
    Ok(())
}

fn read_candidate_meta(
    traversal: &FsTraversal,
    name: &str,
    stat_data: Option<crate::fs_traversal::EntryStat>,
    config: &Config,
) -> Result<(i64, u64), PurgeError> {
    use std::io::Read;

    let cinfo_name = format!("{name}.cinfo");
    let mut f = traversal.open_at_ro(&cinfo_name)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)
        .map_err(|source| OssError::Io { path: traversal.path_at(&cinfo_name), source })?;

    // Captured by the directory scan that paired this entry, not re-stat'd here.
    let fallback_mtime = stat_data.map(|s| s.mtime).unwrap_or(0);
    let allocated_bytes = stat_data.map(|s| s.allocated_blocks * 512);

    let mut cursor = std::io::Cursor::new(buf);
    match Info::read(&mut cursor, config.max_access_log_entries) {
        Ok(info) => {
            let last_access = info.latest_detach_time().unwrap_or(fallback_mtime);
            let size_bytes = allocated_bytes.unwrap_or(info.expected_data_file_size().max(0) as u64);
            Ok((last_access, size_bytes))
        }
        Err(_) => Ok((fallback_mtime, allocated_bytes.unwrap_or(0))),
    }
}

/// Outcome of one purge pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeOutcome {
    pub files_removed: u64,
    pub bytes_removed: u64,
}

/// Runs one purge pass: computes `bytes_to_remove`, walks the tree for
/// candidates, and deletes the least-recently-accessed ones until the
/// target is met (continuing further to sweep up any file older than
/// `cold_age_cutoff` even once the byte target is reached).
/// Re-checks [`Cache::is_file_active_or_purge_protected`] immediately before
/// each deletion and skips the candidate if it raced with a new open.
#[instrument(skip(cache, events), level = "debug")]
pub fn run_pass(
    cache: &Cache,
    events: &EventQueues,
    bytes_target: u64,
    cold_age_cutoff: Option<i64>,
    now: i64,
) -> Result<PurgeOutcome, PurgeError> {
    let config = cache.config();
    let mut traversal = FsTraversal::new(cache.oss().clone(), &config.data_dir, [config.dir_stats.export_dir_name.clone()]);
    traversal.begin_traversal(&config.data_dir)?;

    let candidates = collect_candidates(&mut traversal, cache, config, now)?;

    let mut outcome = PurgeOutcome::default();
    let mut cumulative = 0u64;

    for candidate in candidates {
        let under_target = cumulative < bytes_target;
        let aged_out = cold_age_cutoff.is_some_and(|cutoff| candidate.last_access < cutoff);
        if !under_target && !aged_out {
            break;
        }

        if cache.is_file_active_or_purge_protected(&candidate.lfn) {
            continue;
        }

        let (data_path, cinfo_path) = File::resolve_paths(config, &candidate.lfn);
        cache.oss().unlink(&cinfo_path)?;
        cache.oss().unlink(&data_path)?;

        events.push(crate::resource_monitor::Event::Purge {
            lfn: candidate.lfn.clone(),
            bytes_freed: candidate.size_bytes,
            now,
        });

        cumulative += candidate.size_bytes;
        outcome.bytes_removed += candidate.size_bytes;
        outcome.files_removed += 1;
        debug!(lfn = %candidate.lfn, bytes = candidate.size_bytes, "purged");
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn thresholds(base: u64, nominal: u64, max: u64) -> FileUsageThresholds {
        FileUsageThresholds { base, nominal, max }
    }

    fn watermarks(low: u64, high: u64) -> DiskUsageWatermarks {
        DiskUsageWatermarks { low, high }
    }

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn below_baseline_usage_needs_no_purge() {
        let disk = StatVs { total_bytes: 100 * GIB, used_bytes: 50 * GIB, free_bytes: 50 * GIB };
        let amount = bytes_to_remove(disk, 5 * GIB, watermarks(80 * GIB, 90 * GIB), thresholds(10 * GIB, 60 * GIB, 80 * GIB), 0);
        assert_eq!(amount, 0);
    }

    #[test]
    fn scenario_five_disk_pressure_exceeds_file_usage_pressure() {
        // T=100, w1=80, w2=90, f0=10, f1=60, f2=80, u=95, x=70, δ=1 (GiB).
        let disk = StatVs { total_bytes: 100 * GIB, used_bytes: 95 * GIB, free_bytes: 5 * GIB };
        let amount = bytes_to_remove(disk, 70 * GIB, watermarks(80 * GIB, 90 * GIB), thresholds(10 * GIB, 60 * GIB, 80 * GIB), 1 * GIB);
        assert!(amount > 0);
        assert!(amount >= 10 * GIB && amount <= 80 * GIB);
        // frac_u = 0.5, frac_x = 1.2 -> (1.2-0.5)*50 + 1 = 36 GiB.
        assert_eq!(amount, 36 * GIB);
    }

    #[test]
    fn nominal_band_with_low_file_pressure_removes_nothing() {
        let disk = StatVs { total_bytes: 100 * GIB, used_bytes: 85 * GIB, free_bytes: 15 * GIB };
        let amount = bytes_to_remove(disk, 62 * GIB, watermarks(80 * GIB, 90 * GIB), thresholds(10 * GIB, 60 * GIB, 80 * GIB), 0);
        // frac_u = (85-80)/(90-80) = 0.5, frac_x = (62-60)/(80-60) = 0.1 -> frac_x <= frac_u -> 0.
        assert_eq!(amount, 0);
    }

    #[test]
    fn over_max_file_usage_alone_triggers_purge_down_to_f2() {
        let disk = StatVs { total_bytes: 100 * GIB, used_bytes: 10 * GIB, free_bytes: 90 * GIB };
        let amount = bytes_to_remove(disk, 85 * GIB, watermarks(80 * GIB, 90 * GIB), thresholds(10 * GIB, 60 * GIB, 80 * GIB), 2 * GIB);
        assert_eq!(amount, 85 * GIB - (80 * GIB - 2 * GIB));
    }

    fn test_cache(dir: &std::path::Path) -> std::sync::Arc<Cache> {
        let config = Config::builder(dir).block_size(16).flush_threshold(1).build().unwrap();
        Cache::new(config, std::sync::Arc::new(crate::oss::StdOss))
    }

    #[test]
    fn run_pass_skips_active_file_and_purges_inactive_one() {
        use crate::file::io_binding::test_support::FakeRemote;

        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());

        let active_remote: std::sync::Arc<dyn crate::file::RemoteSource> = std::sync::Arc::new(FakeRemote::new(1, vec![0u8; 16]));
        let (active_file, _io) = cache.get_file("keep.dat", 16, active_remote, true).unwrap();
        let _ = active_file.read(_io, &mut [0u8; 16], 0, 16);

        let inactive_remote: std::sync::Arc<dyn crate::file::RemoteSource> = std::sync::Arc::new(FakeRemote::new(2, vec![0u8; 16]));
        let (inactive_file, io2) = cache.get_file("purge_me.dat", 16, inactive_remote, true).unwrap();
        let _ = inactive_file.read(io2, &mut [0u8; 16], 0, 16);
        cache.release_file(&inactive_file, io2).unwrap();
        drop(inactive_file);

        let events = EventQueues::new();
        let outcome = run_pass(&cache, &events, u64::MAX, None, 1000).unwrap();

        assert_eq!(outcome.files_removed, 1);
        assert!(!dir.path().join("purge_me.dat").exists());
        assert!(dir.path().join("keep.dat").exists());
    }
}
