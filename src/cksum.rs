//! CkSum primitives: page-granular CRC32C over a file's byte stream.
//!
//! A "page" here is a fixed 4 KiB window into the logical file, independent
//! of the cache's block size; the first page of any given `(offset, len)`
//! range may be short if `offset` isn't page-aligned, and the last page may
//! be short if the range doesn't end on a page boundary, but every page in
//! between is exactly [`PAGE_SIZE`] bytes. This layers a page-chunking
//! protocol on top of the `crc32c` crate's hardware-accelerated Castagnoli
//! CRC32, which is taken as a given primitive; this module owns only how
//! pages are carved out of an arbitrary `(offset, len)` byte range.

use snafu::Snafu;

/// Size, in bytes, of one checksum page.
pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Snafu)]
pub enum CkSumError {
    #[snafu(display(
        "checksum vector has {} entries but {} pages are required for offset={} len={}",
        available,
        required,
        offset,
        len
    ))]
    VectorTooShort {
        available: usize,
        required: usize,
        offset: u64,
        len: u64,
    },
}

/// Returns the exact number of checksums needed to cover `len` bytes
/// starting at `offset`, accounting for a leading unaligned fragment.
///
/// `cs_num(0, n*4096) == n`; `cs_num(1, n*4096) == n+1` for `n >= 1`.
pub fn cs_num(offset: u64, len: u64) -> usize {
    if len == 0 {
        return 0;
    }
    let first_page_start = (offset / PAGE_SIZE) * PAGE_SIZE;
    let end = offset + len;
    let last_page_end = end.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    ((last_page_end - first_page_start) / PAGE_SIZE) as usize
}

/// Computes one CRC32C per page covering `buf[offset_in_buf..offset_in_buf+len]`,
/// where `file_offset` is the logical file offset of `buf[offset_in_buf]` and
/// is used only to determine page alignment (the first page may be a short
/// fragment if `file_offset` is not a multiple of [`PAGE_SIZE`]).
///
/// `out_vec` is resized as needed and filled with exactly `cs_num(file_offset, len)` entries.
pub fn cs_calc(buf: &[u8], offset_in_buf: usize, file_offset: u64, len: u64, out_vec: &mut Vec<u32>) {
    out_vec.clear();
    if len == 0 {
        return;
    }
    let data = &buf[offset_in_buf..offset_in_buf + len as usize];

    let first_page_fragment = (file_offset % PAGE_SIZE) as usize;
    let first_chunk_len = if first_page_fragment == 0 {
        PAGE_SIZE as usize
    } else {
        (PAGE_SIZE as usize - first_page_fragment).min(data.len())
    };

    let mut pos = 0usize;
    let mut first = true;
    while pos < data.len() {
        let chunk_len = if first {
            first_chunk_len.min(data.len() - pos)
        } else {
            (PAGE_SIZE as usize).min(data.len() - pos)
        };
        let chunk = &data[pos..pos + chunk_len];
        out_vec.push(crc32c::crc32c(chunk));
        pos += chunk_len;
        first = false;
    }
}

/// Verifies `buf` against a previously computed checksum vector, using the
/// same page alignment rules as [`cs_calc`].
///
/// Returns `Ok(0)` if every page matches. On mismatch, returns the 1-based
/// index of the first bad page and the length, in bytes, of the damaged
/// region (from the start of that page through the end of the verified
/// range).
pub fn cs_ver(
    buf: &[u8],
    offset_in_buf: usize,
    file_offset: u64,
    len: u64,
    expected: &[u32],
) -> Result<(usize, u64), CkSumError> {
    let required = cs_num(file_offset, len);
    if expected.len() < required {
        return Err(CkSumError::VectorTooShort {
            available: expected.len(),
            required,
            offset: file_offset,
            len,
        });
    }
    if len == 0 {
        return Ok((0, 0));
    }

    let mut actual = Vec::with_capacity(required);
    cs_calc(buf, offset_in_buf, file_offset, len, &mut actual);

    let first_page_fragment = file_offset % PAGE_SIZE;
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        if a != e {
            let page_start_in_range = if i == 0 {
                0
            } else {
                PAGE_SIZE - first_page_fragment + (i as u64 - 1) * PAGE_SIZE
            };
            let damaged_len = len - page_start_in_range;
            return Ok((i + 1, damaged_len));
        }
    }
    Ok((0, 0))
}
