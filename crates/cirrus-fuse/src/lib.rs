//! CirrusFS FUSE adapter
//!
//! Translates kernel FUSE requests into calls on the
//! [`cirrus_fs::Filesystem`] operation layer. The adapter owns no policy:
//! it converts inode numbers to item ids, forwards, and maps error kinds
//! to errnos.

pub mod adapter;
pub mod ino;

use std::path::Path;
use std::sync::Arc;

use cirrus_fs::Filesystem;
use fuser::MountOption;

pub use adapter::CirrusFuse;

/// Mounts the filesystem and blocks until unmount. Intended to be called
/// from a thread outside the async runtime; FUSE callbacks re-enter the
/// runtime through the provided handle.
pub fn mount(
    fs: Arc<Filesystem>,
    rt: tokio::runtime::Handle,
    mountpoint: &Path,
) -> std::io::Result<()> {
    let options = [
        MountOption::FSName("cirrusfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];
    let adapter = CirrusFuse::new(fs, rt);
    fuser::mount2(adapter, mountpoint, &options)
}
