//! `pfc` — the persistent disk cache engine for a client-side proxy file system.
//!
//! This crate implements the core of a caching layer that sits between an
//! application reading a remote file and the remote data source itself:
//! block-level download state, a binary sidecar metadata format (the
//! "cinfo" file), concurrent read/prefetch scheduling per open file, and a
//! background resource-monitor/purge subsystem that reclaims disk space
//! without stalling in-flight I/O.
//!
//! Remote-protocol wire framing, authentication, name translation, the
//! CRC32C algorithm itself (assumed available as a primitive), plugin
//! discovery, and configuration-file grammar are all out of scope here;
//! those are external collaborators in the surrounding system.

#[macro_use]
extern crate tracing;

pub mod block;
pub mod cache;
pub mod cksum;
pub mod config;
pub mod dirstate;
pub mod errors;
pub mod file;
pub mod fs_traversal;
pub mod info;
pub mod internal_events;
pub mod io_adapter;
pub mod oss;
pub mod prefetch_coordinator;
pub mod purge;
pub mod resource_monitor;

pub use cache::Cache;
pub use config::{Config, ConfigBuilder};
pub use dirstate::DirState;
pub use errors::PfcError;
pub use resource_monitor::ResourceMonitor;
