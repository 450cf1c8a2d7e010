//! Shared error types.
//!
//! Individual subsystems define their own focused `snafu` error enums next to
//! the code that produces them (e.g. [`crate::info::InfoError`],
//! [`crate::oss::OssError`]); this module only holds the top-level
//! aggregate used at the public API surface, where callers generally just
//! want POSIX-shaped results rather than a specific subsystem's error type.

use snafu::Snafu;

use crate::{
    cache::CacheError, file::FileError, info::InfoError, oss::OssError, purge::PurgeError,
};

/// Top-level error type for operations that can fail across more than one
/// subsystem (e.g. [`crate::Cache::get_file`], which touches the OSS layer,
/// the cinfo layer, and the file-table layer).
#[derive(Debug, Snafu)]
pub enum PfcError {
    #[snafu(display("storage error: {}", source))]
    Storage { source: OssError },

    #[snafu(display("cinfo error: {}", source))]
    Info { source: InfoError },

    #[snafu(display("file error: {}", source))]
    File { source: FileError },

    #[snafu(display("cache error: {}", source))]
    Cache { source: CacheError },

    #[snafu(display("purge error: {}", source))]
    Purge { source: PurgeError },

    /// Programmer error: invalid arguments at an API boundary (bad LFN,
    /// negative offset, etc). Maps to `EINVAL` for POSIX-shaped callers.
    #[snafu(display("invalid argument: {}", reason))]
    InvalidArgument { reason: String },
}

impl PfcError {
    /// Maps this error to the POSIX errno a synchronous read/write API
    /// would surface to its caller.
    pub fn to_errno(&self) -> i32 {
        match self {
            PfcError::InvalidArgument { .. } => libc_einval(),
            PfcError::Storage { source } => source.to_errno(),
            PfcError::Info { .. } => 0, // integrity errors are silently repaired, never user-visible
            PfcError::File { source } => source.to_errno(),
            PfcError::Cache { .. } => libc_eio(),
            PfcError::Purge { .. } => libc_eio(),
        }
    }
}

// We avoid a hard dependency on `libc` purely for two constants; these match
// the standard values on every platform this crate targets.
const fn libc_einval() -> i32 {
    22
}
const fn libc_eio() -> i32 {
    5
}
const fn libc_enoent() -> i32 {
    2
}

pub(crate) use self::{libc_eio as eio, libc_einval as einval, libc_enoent as enoent};
