//! CirrusFS core plane
//!
//! The mount-scoped heart of the filesystem:
//!
//! - [`tree`] - in-memory inode graph with path↔id resolution, lazy child
//!   lists, and FUSE handle accounting
//! - [`download`] - single-flight on-demand downloads with shared waiters
//! - [`upload`] - durable, priority-queued, conflict-detecting uploads
//! - [`delta`] - the remote change-feed reconciliation loop
//! - [`offline`] - the online/degraded/offline connectivity detector
//! - [`ops`] - the FS operation layer the FUSE adapter calls into
//!
//! One [`ops::Filesystem`] value owns all of the above plus the metadata
//! store, content cache, remote client, and status bus; the authentication
//! subsystem is a capability injected at construction.

pub mod delta;
pub mod download;
pub mod handles;
pub mod offline;
pub mod ops;
pub mod tree;
pub mod upload;
pub mod xattr;

pub use ops::{Filesystem, FilesystemOptions};
