//! Access log: the per-attach record appended to cinfo and compacted in
//! place once it grows past `max_access` entries.

/// One access record: a single attach/detach window and its transfer stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessRecord {
    pub attach: i64,
    pub detach: i64,
    pub num_ios: i32,
    pub duration: i32,
    pub num_merged: i32,
    pub bytes_hit: i64,
    pub bytes_missed: i64,
    pub bytes_bypassed: i64,
}

impl AccessRecord {
    pub const ENCODED_LEN: usize = 8 * 3 + 4 * 3 + 8 * 3;

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.attach.to_le_bytes());
        out.extend_from_slice(&self.detach.to_le_bytes());
        out.extend_from_slice(&self.num_ios.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());
        out.extend_from_slice(&self.num_merged.to_le_bytes());
        out.extend_from_slice(&self.bytes_hit.to_le_bytes());
        out.extend_from_slice(&self.bytes_missed.to_le_bytes());
        out.extend_from_slice(&self.bytes_bypassed.to_le_bytes());
    }

    pub fn read_from(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut pos = 0;
        macro_rules! take {
            ($ty:ty) => {{
                let n = std::mem::size_of::<$ty>();
                let v = <$ty>::from_le_bytes(buf[pos..pos + n].try_into().unwrap());
                pos += n;
                v
            }};
        }
        let rec = AccessRecord {
            attach: take!(i64),
            detach: take!(i64),
            num_ios: take!(i32),
            duration: take!(i32),
            num_merged: take!(i32),
            bytes_hit: take!(i64),
            bytes_missed: take!(i64),
            bytes_bypassed: take!(i64),
        };
        Some((rec, &buf[pos..]))
    }

    /// Merges `other` (the later record) into `self` in place: retains this
    /// record's attach time, takes the other's detach time, and sums counters.
    fn merge_with(&mut self, other: &AccessRecord) {
        self.detach = other.detach;
        self.num_ios += other.num_ios;
        self.duration += other.duration;
        self.num_merged += other.num_merged + 1;
        self.bytes_hit += other.bytes_hit;
        self.bytes_missed += other.bytes_missed;
        self.bytes_bypassed += other.bytes_bypassed;
    }
}

/// Compacts `log` in place until its length is at most `max_access`.
///
/// While `|log| > max_access`, compute for each adjacent
/// pair `(A, B)` the score `s = (B.attach - A.detach) / max(1, (now -
/// B.attach)/2 + (now - A.detach)/2)`, merge the pair with the smallest
/// score (retaining `A`'s attach time and `B`'s detach time, summing
/// counters, incrementing `num_merged`), breaking ties by lowest index.
/// Idempotent once `|log| <= max_access`.
pub fn compact(log: &mut Vec<AccessRecord>, max_access: usize, now: i64) {
    while log.len() > max_access {
        let mut best_idx = 0usize;
        let mut best_score = f64::INFINITY;
        for i in 0..log.len() - 1 {
            let a = &log[i];
            let b = &log[i + 1];
            let gap = (b.attach - a.detach) as f64;
            let age = (now - b.attach) as f64 / 2.0 + (now - a.detach) as f64 / 2.0;
            let score = gap / age.max(1.0);
            if score < best_score {
                best_score = score;
                best_idx = i;
            }
        }
        let next = log.remove(best_idx + 1);
        log[best_idx].merge_with(&next);
    }
}
