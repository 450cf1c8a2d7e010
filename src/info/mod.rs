//! The cinfo sidecar: a binary metadata file recording the download bitmap,
//! page checksums, and access history for one cached file. This module
//! implements version 3 of the on-disk layout.

pub mod access_log;
pub mod bitmap;

use std::io::{self, Read, Write};

use md5::{Digest, Md5};
use snafu::Snafu;

use crate::config::CkSumPolicy;

pub use access_log::AccessRecord;
pub use bitmap::Bitmap;

/// Current on-disk layout version. Positive means current; the reader also
/// accepts `-1` and `-2` (older variants), treating them as read-only legacy
/// layouts that get upgraded to `CURRENT_VERSION` on next write.
pub const CURRENT_VERSION: i32 = 3;

#[derive(Debug, Snafu)]
pub enum InfoError {
    #[snafu(display("I/O error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("unsupported cinfo version {}", version))]
    UnsupportedVersion { version: i32 },

    #[snafu(display("cinfo file is truncated: expected at least {} more bytes", needed))]
    ShortRead { needed: usize },

    #[snafu(display("bitmap MD5 mismatch: cinfo is corrupt"))]
    Md5Mismatch,
}

impl From<io::Error> for InfoError {
    fn from(source: io::Error) -> Self {
        InfoError::Io { source }
    }
}

/// A single page's checksum-verification state, used only when the
/// configured [`CkSumPolicy`] requires persisted CRCs.
#[derive(Debug, Clone, Default)]
struct CkSumState {
    page_crc32c: Vec<u32>,
    page_verified: Bitmap,
}

/// In-memory representation of a cinfo file.
#[derive(Debug, Clone)]
pub struct Info {
    version: i32,
    buffer_size: i64,
    file_size: i64,
    bitmap: Bitmap,
    /// Parallel bit-vector marking blocks that were obtained via the
    /// prefetcher rather than on demand, so prefetch effectiveness can be
    /// measured separately from demand hit rate.
    prefetch_bitmap: Bitmap,
    created_at: i64,
    access_count: u64,
    access_log: Vec<AccessRecord>,
    active_access: Option<AccessRecord>,
    max_access: usize,
    cksum_policy: CkSumPolicy,
    cksum: CkSumState,
}

impl Info {
    /// Initializes fresh in-memory cinfo state for a newly opened file. The
    /// caller is responsible for persisting it via [`Info::write`].
    pub fn create(file_size: i64, block_size: i64, cs_policy: CkSumPolicy, max_access: usize, now: i64) -> Self {
        let num_blocks = if block_size <= 0 {
            0
        } else {
            (file_size.max(0) as u64).div_ceil(block_size as u64) as usize
        };
        let cksum = if cs_policy.persists_crc() {
            CkSumState {
                page_crc32c: vec![0u32; crate::cksum::cs_num(0, file_size.max(0) as u64)],
                page_verified: Bitmap::new(crate::cksum::cs_num(0, file_size.max(0) as u64)),
            }
        } else {
            CkSumState::default()
        };

        Self {
            version: CURRENT_VERSION,
            buffer_size: block_size,
            file_size,
            bitmap: Bitmap::new(num_blocks),
            prefetch_bitmap: Bitmap::new(num_blocks),
            created_at: now,
            access_count: 0,
            access_log: Vec::new(),
            active_access: None,
            max_access,
            cksum_policy: cs_policy,
            cksum,
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn buffer_size(&self) -> i64 {
        self.buffer_size
    }

    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    pub fn num_blocks(&self) -> usize {
        self.bitmap.len()
    }

    pub fn set_bit_written(&mut self, i: usize) {
        self.bitmap.set(i);
    }

    pub fn test_bit_written(&self, i: usize) -> bool {
        self.bitmap.test(i)
    }

    pub fn set_bit_prefetch(&mut self, i: usize) {
        self.prefetch_bitmap.set(i);
    }

    pub fn test_bit_prefetch(&self, i: usize) -> bool {
        self.prefetch_bitmap.test(i)
    }

    pub fn set_all_bits_synced(&mut self) {
        self.bitmap.set_all();
    }

    pub fn is_complete(&self) -> bool {
        self.bitmap.is_complete()
    }

    /// Expected size of the data file on disk given the current bitmap:
    /// `(index of highest set bit + 1) * buffer_size`, or exactly
    /// `file_size` if the last block is set.
    pub fn expected_data_file_size(&self) -> i64 {
        let Some(highest) = self.bitmap.highest_set_bit() else {
            return 0;
        };
        if highest + 1 == self.bitmap.len() {
            self.file_size
        } else {
            (highest as i64 + 1) * self.buffer_size
        }
    }

    pub fn cksum_policy(&self) -> CkSumPolicy {
        self.cksum_policy
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Upgrades the stored policy in place without touching existing page
    /// CRCs: pages fetched before the upgrade remain unverified (absent from
    /// the CRC vector) and are backfilled lazily as they're re-fetched.
    pub fn upgrade_cksum_policy_accept_missing(&mut self, new_policy: CkSumPolicy) {
        if new_policy > self.cksum_policy {
            self.cksum_policy = new_policy;
        }
    }

    /// Downgrades (or accepts with missing bits flagged) the stored checksum
    /// policy in place. Downgrading in place is always safe; upgrading
    /// requires the caller to decide, based on `uvkeep`, whether to reset
    /// instead (handled by [`crate::file::File`]).
    pub fn downgrade_cksum_policy(&mut self, new_policy: CkSumPolicy) {
        if new_policy < self.cksum_policy {
            self.cksum_policy = new_policy;
            if !new_policy.persists_crc() {
                self.cksum = CkSumState::default();
            }
        }
    }

    pub fn crc_for_page(&self, page: usize) -> Option<u32> {
        self.cksum.page_crc32c.get(page).copied()
    }

    pub fn set_crc_for_page(&mut self, page: usize, crc: u32) {
        if page >= self.cksum.page_crc32c.len() {
            self.cksum.page_crc32c.resize(page + 1, 0);
        }
        if page >= self.cksum.page_verified.len() {
            let mut bm = Bitmap::new(page + 1);
            for i in 0..self.cksum.page_verified.len() {
                if self.cksum.page_verified.test(i) {
                    bm.set(i);
                }
            }
            self.cksum.page_verified = bm;
        }
        self.cksum.page_crc32c[page] = crc;
        self.cksum.page_verified.set(page);
    }

    pub fn is_page_verified(&self, page: usize) -> bool {
        page < self.cksum.page_verified.len() && self.cksum.page_verified.test(page)
    }

    /// Opens a new active access record. Corresponds to `write_io_stat_attach`.
    pub fn write_io_stat_attach(&mut self, now: i64) {
        self.active_access = Some(AccessRecord {
            attach: now,
            num_ios: 1,
            ..Default::default()
        });
        self.access_count += 1;
    }

    /// Closes the active access record with the given detach time and
    /// accumulated byte counters, appending it to the log and compacting if
    /// it now exceeds `max_access`. Corresponds to `write_io_stat_detach`.
    pub fn write_io_stat_detach(&mut self, now: i64, bytes_hit: i64, bytes_missed: i64, bytes_bypassed: i64) {
        let mut rec = self.active_access.take().unwrap_or_default();
        rec.detach = now;
        rec.duration = (now - rec.attach).max(0) as i32;
        rec.bytes_hit += bytes_hit;
        rec.bytes_missed += bytes_missed;
        rec.bytes_bypassed += bytes_bypassed;
        self.access_log.push(rec);
        access_log::compact(&mut self.access_log, self.max_access, now);
    }

    /// `true` iff there is an open (attached, not yet detached) access record.
    pub fn has_active_access(&self) -> bool {
        self.active_access.is_some()
    }

    pub fn access_log(&self) -> &[AccessRecord] {
        &self.access_log
    }

    /// Latest detach time recorded in the access log, used as the purge
    /// age fallback's preferred source over the data file's mtime.
    pub fn latest_detach_time(&self) -> Option<i64> {
        self.access_log.iter().map(|r| r.detach).max()
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Serializes this cinfo to `writer`, compacting the access log to
    /// `max_access` first.
    pub fn write(&mut self, writer: &mut impl Write) -> Result<(), InfoError> {
        access_log::compact(&mut self.access_log, self.max_access, self.created_at);

        writer.write_all(&CURRENT_VERSION.to_le_bytes())?;
        writer.write_all(&self.buffer_size.to_le_bytes())?;
        writer.write_all(&self.file_size.to_le_bytes())?;
        writer.write_all(&(self.bitmap.len() as u64).to_le_bytes())?;
        writer.write_all(self.bitmap.as_bytes())?;

        let md5 = bitmap_md5(&self.bitmap);
        writer.write_all(&md5)?;

        writer.write_all(self.prefetch_bitmap.as_bytes())?;

        writer.write_all(&self.created_at.to_le_bytes())?;
        writer.write_all(&self.access_count.to_le_bytes())?;

        writer.write_all(&(self.access_log.len() as u32).to_le_bytes())?;
        let mut buf = Vec::with_capacity(self.access_log.len() * AccessRecord::ENCODED_LEN);
        for rec in &self.access_log {
            rec.write_to(&mut buf);
        }
        writer.write_all(&buf)?;

        let persists = self.cksum_policy.persists_crc();
        writer.write_all(&[persists as u8])?;
        if persists {
            writer.write_all(&(self.cksum.page_crc32c.len() as u32).to_le_bytes())?;
            for crc in &self.cksum.page_crc32c {
                writer.write_all(&crc.to_le_bytes())?;
            }
            writer.write_all(self.cksum.page_verified.as_bytes())?;
        }

        Ok(())
    }

    /// Deserializes a cinfo file, verifying the bitmap MD5. Any failure here
    /// (unsupported version, short read, MD5 mismatch) means the caller
    /// must treat the data+cinfo pair as corrupt and reset it.
    pub fn read(reader: &mut impl Read, max_access: usize) -> Result<Self, InfoError> {
        let mut i32buf = [0u8; 4];
        let mut i64buf = [0u8; 8];
        let mut u64buf = [0u8; 8];

        reader.read_exact(&mut i32buf)?;
        let version = i32::from_le_bytes(i32buf);
        if version.abs() > CURRENT_VERSION || version == 0 {
            return Err(InfoError::UnsupportedVersion { version });
        }

        reader.read_exact(&mut i64buf)?;
        let buffer_size = i64::from_le_bytes(i64buf);
        reader.read_exact(&mut i64buf)?;
        let file_size = i64::from_le_bytes(i64buf);

        reader.read_exact(&mut u64buf)?;
        let bitmap_len = u64::from_le_bytes(u64buf) as usize;
        let mut bitmap_bytes = vec![0u8; bitmap_len.div_ceil(8)];
        reader.read_exact(&mut bitmap_bytes)?;
        let bitmap = Bitmap::from_bytes(bitmap_bytes, bitmap_len);

        let mut md5_on_disk = [0u8; 16];
        reader.read_exact(&mut md5_on_disk)?;
        if bitmap_md5(&bitmap) != md5_on_disk {
            return Err(InfoError::Md5Mismatch);
        }

        let mut prefetch_bytes = vec![0u8; bitmap_len.div_ceil(8)];
        reader.read_exact(&mut prefetch_bytes)?;
        let prefetch_bitmap = Bitmap::from_bytes(prefetch_bytes, bitmap_len);

        reader.read_exact(&mut i64buf)?;
        let created_at = i64::from_le_bytes(i64buf);
        reader.read_exact(&mut u64buf)?;
        let access_count = u64::from_le_bytes(u64buf);

        reader.read_exact(&mut i32buf)?;
        let n_records = u32::from_le_bytes(i32buf) as usize;
        let mut log_bytes = vec![0u8; n_records * AccessRecord::ENCODED_LEN];
        reader.read_exact(&mut log_bytes)?;
        let mut access_log = Vec::with_capacity(n_records);
        let mut rest: &[u8] = &log_bytes;
        for _ in 0..n_records {
            let (rec, r) = AccessRecord::read_from(rest).ok_or(InfoError::ShortRead {
                needed: AccessRecord::ENCODED_LEN,
            })?;
            access_log.push(rec);
            rest = r;
        }

        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let persists = flag[0] != 0;
        let (cksum_policy, cksum) = if persists {
            reader.read_exact(&mut i32buf)?;
            let n_pages = u32::from_le_bytes(i32buf) as usize;
            let mut page_crc32c = Vec::with_capacity(n_pages);
            for _ in 0..n_pages {
                reader.read_exact(&mut i32buf)?;
                page_crc32c.push(u32::from_le_bytes(i32buf));
            }
            let mut verified_bytes = vec![0u8; n_pages.div_ceil(8)];
            reader.read_exact(&mut verified_bytes)?;
            let page_verified = Bitmap::from_bytes(verified_bytes, n_pages);
            (
                CkSumPolicy::Cache,
                CkSumState {
                    page_crc32c,
                    page_verified,
                },
            )
        } else {
            (CkSumPolicy::None, CkSumState::default())
        };

        Ok(Self {
            version,
            buffer_size,
            file_size,
            bitmap,
            prefetch_bitmap,
            created_at,
            access_count,
            access_log,
            active_access: None,
            max_access,
            cksum_policy,
            cksum,
        })
    }
}

fn bitmap_md5(bitmap: &Bitmap) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(bitmap.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn roundtrip_preserves_bitmap_and_size() {
        let mut info = Info::create(10 * 1024 * 1024, 1024 * 1024, CkSumPolicy::None, 20, 1000);
        info.set_bit_written(0);
        info.set_bit_written(1);

        let mut buf = Vec::new();
        info.write(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        let loaded = Info::read(&mut cursor, 20).unwrap();
        assert_eq!(loaded.file_size(), 10 * 1024 * 1024);
        assert_eq!(loaded.buffer_size(), 1024 * 1024);
        assert!(loaded.test_bit_written(0));
        assert!(loaded.test_bit_written(1));
        assert!(!loaded.test_bit_written(2));
    }

    #[test]
    fn corrupt_md5_is_detected() {
        let mut info = Info::create(4096, 4096, CkSumPolicy::None, 20, 1000);
        info.set_bit_written(0);
        let mut buf = Vec::new();
        info.write(&mut buf).unwrap();

        // Flip a bit inside the bitmap region (right after the 4+8+8+8 header).
        let bitmap_offset = 4 + 8 + 8 + 8;
        buf[bitmap_offset] ^= 0xFF;

        let mut cursor = Cursor::new(buf);
        let err = Info::read(&mut cursor, 20).unwrap_err();
        assert!(matches!(err, InfoError::Md5Mismatch));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let buf = vec![99, 0, 0, 0];
        let mut cursor = Cursor::new(buf);
        let err = Info::read(&mut cursor, 20).unwrap_err();
        assert!(matches!(err, InfoError::UnsupportedVersion { version: 99 }));
    }

    #[test]
    fn short_read_is_an_io_error() {
        let buf = vec![3, 0, 0, 0, 1, 2, 3];
        let mut cursor = Cursor::new(buf);
        let err = Info::read(&mut cursor, 20).unwrap_err();
        assert!(matches!(err, InfoError::Io { .. }));
    }

    #[test]
    fn attach_detach_cycle_has_sane_access_record() {
        let mut info = Info::create(4096, 4096, CkSumPolicy::None, 20, 0);
        info.write_io_stat_attach(100);
        info.write_io_stat_detach(150, 10, 20, 0);

        let mut buf = Vec::new();
        info.write(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let loaded = Info::read(&mut cursor, 20).unwrap();

        let rec = loaded.access_log().last().unwrap();
        assert!(rec.detach >= rec.attach);
        assert!(rec.duration >= 0);
        assert!(rec.bytes_hit >= 0 && rec.bytes_missed >= 0 && rec.bytes_bypassed >= 0);
    }

    #[test]
    fn expected_data_file_size_matches_highest_block_or_exact_size() {
        let mut info = Info::create(10, 4, CkSumPolicy::None, 20, 0); // 3 blocks: 4,4,2
        assert_eq!(info.expected_data_file_size(), 0);
        info.set_bit_written(0);
        assert_eq!(info.expected_data_file_size(), 4);
        info.set_bit_written(2);
        assert_eq!(info.expected_data_file_size(), 10); // last block -> exact file size
    }

    #[test]
    fn cksum_policy_downgrade_drops_persisted_crcs() {
        let mut info = Info::create(8192, 4096, CkSumPolicy::Cache, 20, 0);
        info.set_crc_for_page(0, 0xdead_beef);
        info.downgrade_cksum_policy(CkSumPolicy::None);
        assert_eq!(info.cksum_policy(), CkSumPolicy::None);
        assert_eq!(info.crc_for_page(0), None);
    }
}
