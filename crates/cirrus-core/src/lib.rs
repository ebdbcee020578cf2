//! CirrusFS Core - Domain model, ports, and configuration
//!
//! This crate contains the mount-neutral building blocks shared by every
//! other CirrusFS crate:
//! - **Domain entities** - `Inode`, `UploadSession`, `FileStatus`, `ItemId`
//! - **Port definitions** - `RemoteDrive` (the remote API capability) and
//!   `TokenSource` (the auth capability)
//! - **QuickXOR** - the 160-bit content hash used by the remote, implemented
//!   in-tree so cached bodies can be verified without network access
//! - **Status bus** - in-process publish/subscribe of file-status events
//! - **Configuration** - typed config with YAML loading and validation
//!
//! # Architecture
//!
//! The domain module is pure business logic with no I/O. Ports define the
//! two capability interfaces that adapter crates implement (`cirrus-graph`
//! for the remote API, the auth subsystem for tokens); everything else in
//! the workspace depends on concrete types.

pub mod config;
pub mod domain;
pub mod events;
pub mod hash;
pub mod ports;
