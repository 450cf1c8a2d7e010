//! Cache-wide configuration knobs: a plain data struct plus a validating
//! builder, rather than a config-file parser, which is out of scope here.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use snafu::Snafu;

/// Checksum policy for cached pages, corresponding to `cschk {none,net,cache,both}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CkSumPolicy {
    /// No page checksums stored or verified.
    None,
    /// Checksums verified against the remote source but not stored in cinfo.
    Net,
    /// Checksums stored in cinfo and verified on cache hits.
    Cache,
    /// Both net and cache verification.
    Both,
}

impl CkSumPolicy {
    /// Whether this policy requires the per-page CRC vector to be persisted in cinfo.
    pub fn persists_crc(self) -> bool {
        matches!(self, CkSumPolicy::Cache | CkSumPolicy::Both)
    }
}

/// `diskusage LWM HWM` — disk-level watermarks used by the space-based purge trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskUsageWatermarks {
    /// Low watermark (`w1`), in bytes.
    pub low: u64,
    /// High watermark (`w2`), in bytes.
    pub high: u64,
}

/// `filesusage base nominal max` — cache-file-usage thresholds used by the
/// space-based purge trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileUsageThresholds {
    /// Baseline (`f0`): below this, no purge is considered necessary.
    pub base: u64,
    /// Nominal (`f1`).
    pub nominal: u64,
    /// Max (`f2`): above this, purge regardless of disk pressure.
    pub max: u64,
}

/// `purgecoldfiles age period` knob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColdFilePurgeConfig {
    pub enabled: bool,
    pub age: Duration,
    pub every_n_cycles: u32,
}

impl Default for ColdFilePurgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            age: Duration::from_secs(3 * 24 * 3600),
            every_n_cycles: 10,
        }
    }
}

/// `wqueue blocks=B threads=T` knob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteQueueConfig {
    pub max_blocks: usize,
    pub threads: usize,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_blocks: 1024,
            threads: 4,
        }
    }
}

/// `prefetch {on,off} max=N` knob.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchConfig {
    pub enabled: bool,
    pub max_blocks: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_blocks: 10,
        }
    }
}

/// `dirstats depth=D interval=I` knob.
#[derive(Debug, Clone, PartialEq)]
pub struct DirStatsConfig {
    pub depth: u32,
    pub interval: Duration,
    pub export_dir_name: String,
}

impl Default for DirStatsConfig {
    fn default() -> Self {
        Self {
            depth: 2,
            interval: Duration::from_secs(300),
            export_dir_name: "pfc-stats".to_string(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Full, validated cache configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub meta_dir: PathBuf,
    pub block_size: u64,
    pub disk_usage: DiskUsageWatermarks,
    pub file_usage: FileUsageThresholds,
    pub purge_interval: Duration,
    pub purge_cold_files: ColdFilePurgeConfig,
    pub cksum_policy: CkSumPolicy,
    pub uvkeep: Duration,
    pub flush_threshold: u32,
    pub prefetch: PrefetchConfig,
    pub ram_bytes: u64,
    pub write_queue: WriteQueueConfig,
    pub dir_stats: DirStatsConfig,
    pub hdfs_block_size: Option<u64>,
    pub max_access_log_entries: usize,
}

impl Config {
    pub fn builder<P: AsRef<Path>>(data_dir: P) -> ConfigBuilder {
        ConfigBuilder::from_data_dir(data_dir)
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    data_dir: PathBuf,
    meta_dir: Option<PathBuf>,
    block_size: Option<u64>,
    disk_usage: Option<DiskUsageWatermarks>,
    file_usage: Option<FileUsageThresholds>,
    purge_interval: Option<Duration>,
    purge_cold_files: ColdFilePurgeConfig,
    cksum_policy: CkSumPolicy,
    uvkeep: Duration,
    flush_threshold: u32,
    prefetch: PrefetchConfig,
    ram_bytes: u64,
    write_queue: WriteQueueConfig,
    dir_stats: DirStatsConfig,
    hdfs_block_size: Option<u64>,
    max_access_log_entries: usize,
}

impl ConfigBuilder {
    pub fn from_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            meta_dir: None,
            block_size: None,
            disk_usage: None,
            file_usage: None,
            purge_interval: None,
            purge_cold_files: ColdFilePurgeConfig::default(),
            cksum_policy: CkSumPolicy::None,
            uvkeep: Duration::from_secs(3600),
            flush_threshold: 8,
            prefetch: PrefetchConfig::default(),
            ram_bytes: 256 * 1024 * 1024,
            write_queue: WriteQueueConfig::default(),
            dir_stats: DirStatsConfig::default(),
            hdfs_block_size: None,
            max_access_log_entries: 20,
        }
    }

    pub fn meta_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.meta_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = Some(bytes);
        self
    }

    pub fn disk_usage(mut self, low: u64, high: u64) -> Self {
        self.disk_usage = Some(DiskUsageWatermarks { low, high });
        self
    }

    pub fn file_usage(mut self, base: u64, nominal: u64, max: u64) -> Self {
        self.file_usage = Some(FileUsageThresholds { base, nominal, max });
        self
    }

    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = Some(interval);
        self
    }

    pub fn purge_cold_files(mut self, age: Duration, every_n_cycles: u32) -> Self {
        self.purge_cold_files = ColdFilePurgeConfig {
            enabled: true,
            age,
            every_n_cycles,
        };
        self
    }

    pub fn cksum_policy(mut self, policy: CkSumPolicy, uvkeep: Duration) -> Self {
        self.cksum_policy = policy;
        self.uvkeep = uvkeep;
        self
    }

    pub fn flush_threshold(mut self, count: u32) -> Self {
        self.flush_threshold = count;
        self
    }

    pub fn prefetch(mut self, enabled: bool, max_blocks: usize) -> Self {
        self.prefetch = PrefetchConfig { enabled, max_blocks };
        self
    }

    pub fn ram_bytes(mut self, bytes: u64) -> Self {
        self.ram_bytes = bytes;
        self
    }

    pub fn write_queue(mut self, max_blocks: usize, threads: usize) -> Self {
        self.write_queue = WriteQueueConfig { max_blocks, threads };
        self
    }

    pub fn dir_stats(mut self, depth: u32, interval: Duration) -> Self {
        self.dir_stats.depth = depth;
        self.dir_stats.interval = interval;
        self
    }

    pub fn hdfs_block_size(mut self, bytes: u64) -> Self {
        self.hdfs_block_size = Some(bytes);
        self
    }

    pub fn max_access_log_entries(mut self, n: usize) -> Self {
        self.max_access_log_entries = n;
        self
    }

    pub fn build(self) -> Result<Config, BuildError> {
        let block_size = self.block_size.unwrap_or(1024 * 1024);
        if block_size == 0 || (block_size & (block_size - 1)) != 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "block_size",
                reason: "must be a non-zero power of two".to_string(),
            });
        }

        let disk_usage = self.disk_usage.unwrap_or(DiskUsageWatermarks {
            low: 0,
            high: u64::MAX,
        });
        if disk_usage.low > disk_usage.high {
            return Err(BuildError::InvalidParameter {
                param_name: "disk_usage",
                reason: "low watermark must not exceed high watermark".to_string(),
            });
        }

        let file_usage = self.file_usage.unwrap_or(FileUsageThresholds {
            base: 0,
            nominal: u64::MAX,
            max: u64::MAX,
        });
        if !(file_usage.base <= file_usage.nominal && file_usage.nominal <= file_usage.max) {
            return Err(BuildError::InvalidParameter {
                param_name: "file_usage",
                reason: "must satisfy base <= nominal <= max".to_string(),
            });
        }

        if self.max_access_log_entries == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_access_log_entries",
                reason: "cannot be zero".to_string(),
            });
        }

        if self.write_queue.threads == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "write_queue.threads",
                reason: "cannot be zero".to_string(),
            });
        }

        let meta_dir = self.meta_dir.unwrap_or_else(|| self.data_dir.clone());

        Ok(Config {
            data_dir: self.data_dir,
            meta_dir,
            block_size,
            disk_usage,
            file_usage,
            purge_interval: self.purge_interval.unwrap_or(Duration::from_secs(300)),
            purge_cold_files: self.purge_cold_files,
            cksum_policy: self.cksum_policy,
            uvkeep: self.uvkeep,
            flush_threshold: self.flush_threshold,
            prefetch: self.prefetch,
            ram_bytes: self.ram_bytes,
            write_queue: self.write_queue,
            dir_stats: self.dir_stats,
            hdfs_block_size: self.hdfs_block_size,
            max_access_log_entries: self.max_access_log_entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let err = Config::builder("/tmp/cache").block_size(3).build().unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { param_name: "block_size", .. }));
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let err = Config::builder("/tmp/cache")
            .disk_usage(90, 10)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { param_name: "disk_usage", .. }));
    }

    #[test]
    fn defaults_meta_dir_to_data_dir() {
        let cfg = Config::builder("/tmp/cache").build().unwrap();
        assert_eq!(cfg.meta_dir, cfg.data_dir);
    }

    #[test]
    fn accepts_well_formed_config() {
        let cfg = Config::builder("/tmp/cache")
            .meta_dir("/tmp/meta")
            .block_size(2 * 1024 * 1024)
            .disk_usage(80, 90)
            .file_usage(10, 60, 80)
            .build()
            .unwrap();
        assert_eq!(cfg.block_size, 2 * 1024 * 1024);
        assert_eq!(cfg.disk_usage.low, 80);
    }
}
