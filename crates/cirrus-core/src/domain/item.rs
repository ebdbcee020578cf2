//! Inode records
//!
//! An [`Inode`] is the persisted metadata record for one drive item. The
//! in-memory inode graph holds these under per-inode locks; the metadata
//! store serializes them as JSON into the `inodes` table. Nothing in memory
//! is considered durable until written there.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::CoreError;
use super::ids::ItemId;
use super::status::FileStatus;

/// Default mode bits for files (rw-r--r--).
pub const FILE_MODE: u32 = 0o644;

/// Default mode bits for directories (rwxr-xr-x).
pub const DIR_MODE: u32 = 0o755;

/// The type of a drive item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Regular file
    File,
    /// Directory
    Folder,
    /// Opaque bundle (e.g. a notebook); treated as a file by POSIX clients
    Package,
}

impl ItemKind {
    /// Returns true for kinds exposed as directories.
    pub fn is_dir(&self) -> bool {
        matches!(self, ItemKind::Folder)
    }
}

/// Small per-inode flag set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeFlags {
    /// Tombstoned locally or by the remote; removal completes at last close
    #[serde(default)]
    pub deleted: bool,
    /// The cached body differs from the remote version (invariant: a body
    /// exists in the content cache whenever this is set)
    #[serde(default)]
    pub has_changes: bool,
    /// The last upload attempt for this inode failed past its budget
    #[serde(default)]
    pub has_upload_error: bool,
    /// User asked for this item to be kept cached
    #[serde(default)]
    pub pinned: bool,
}

/// Persisted metadata record for one drive item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    /// Server-assigned opaque id, or a `local-` id before first upload
    pub id: ItemId,
    /// Display name (case preserved)
    pub name: String,
    /// Parent folder id; `None` only for the root
    pub parent: Option<ItemId>,
    /// File, folder, or package
    pub kind: ItemKind,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// POSIX mode bits derived from server flags + defaults
    pub mode: u32,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Server version token for optimistic concurrency
    pub etag: Option<String>,
    /// QuickXOR content hash (base64) as last reported or computed
    pub hash: Option<String>,
    /// MIME type reported by the server
    pub mime: Option<String>,
    /// Flag set
    #[serde(default)]
    pub flags: InodeFlags,
    /// Current position in the file-status machine
    #[serde(default)]
    pub status: FileStatus,
    /// Message of the most recent error, if the status is Error/Conflict
    pub last_error: Option<String>,
}

impl Inode {
    /// Creates the root record with the well-known id.
    pub fn new_root() -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::root(),
            name: String::new(),
            parent: None,
            kind: ItemKind::Folder,
            size: 0,
            mode: DIR_MODE,
            created: now,
            modified: now,
            etag: None,
            hash: None,
            mime: None,
            flags: InodeFlags::default(),
            status: FileStatus::Cached,
            last_error: None,
        }
    }

    /// Creates a locally-originated file under `parent`.
    ///
    /// The record gets a local-only id, `LocalModified` status, and the
    /// has-changes flag; the caller is responsible for creating the empty
    /// body in the content cache before persisting (invariant I4).
    pub fn new_local_file(name: impl Into<String>, parent: ItemId, mode: u32) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new_local(),
            name: name.into(),
            parent: Some(parent),
            kind: ItemKind::File,
            size: 0,
            mode,
            created: now,
            modified: now,
            etag: None,
            hash: None,
            mime: None,
            flags: InodeFlags {
                has_changes: true,
                ..InodeFlags::default()
            },
            status: FileStatus::LocalModified,
            last_error: None,
        }
    }

    /// Creates a locally-originated folder under `parent`.
    ///
    /// Folders are created remotely through a direct call rather than an
    /// upload session, so the record starts clean.
    pub fn new_local_folder(name: impl Into<String>, parent: ItemId) -> Self {
        let now = Utc::now();
        Self {
            id: ItemId::new_local(),
            name: name.into(),
            parent: Some(parent),
            kind: ItemKind::Folder,
            size: 0,
            mode: DIR_MODE,
            created: now,
            modified: now,
            etag: None,
            hash: None,
            mime: None,
            flags: InodeFlags::default(),
            status: FileStatus::Cached,
            last_error: None,
        }
    }

    /// Returns true for directory-kind inodes.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Validated status transition; the caller publishes the event.
    ///
    /// Returns `Ok(true)` if the status actually changed, `Ok(false)` for a
    /// no-op self-transition.
    pub fn transition_status(&mut self, target: FileStatus) -> Result<bool, CoreError> {
        if self.status == target {
            return Ok(false);
        }
        self.status.transition_to(target)?;
        if !matches!(target, FileStatus::Error | FileStatus::Conflict) {
            self.last_error = None;
        }
        Ok(true)
    }

    /// Marks the body dirty after a local write.
    pub fn mark_dirty(&mut self) {
        self.flags.has_changes = true;
        self.modified = Utc::now();
    }

    /// Records a terminal error on this inode.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.flags.has_upload_error = true;
        self.last_error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_root() {
        let root = Inode::new_root();
        assert_eq!(root.id.as_str(), "root");
        assert!(root.parent.is_none());
        assert!(root.is_dir());
    }

    #[test]
    fn test_new_local_file_satisfies_invariants() {
        let parent = ItemId::new("PARENT");
        let inode = Inode::new_local_file("draft.txt", parent.clone(), FILE_MODE);

        // I5: a local-only id implies hasChanges and a pending upload
        assert!(inode.id.is_local());
        assert!(inode.flags.has_changes);
        assert_eq!(inode.status, FileStatus::LocalModified);
        assert_eq!(inode.parent, Some(parent));
        assert!(!inode.is_dir());
    }

    #[test]
    fn test_new_local_folder_is_clean() {
        let folder = Inode::new_local_folder("projects", ItemId::root());
        assert!(folder.is_dir());
        assert!(!folder.flags.has_changes);
        assert_eq!(folder.mode, DIR_MODE);
    }

    #[test]
    fn test_transition_status_reports_change() {
        let mut inode = Inode::new_root();
        inode.status = FileStatus::Cloud;

        assert!(inode.transition_status(FileStatus::Downloading).unwrap());
        assert!(!inode.transition_status(FileStatus::Downloading).unwrap());
        assert!(inode.transition_status(FileStatus::Cached).unwrap());
    }

    #[test]
    fn test_transition_clears_stale_error() {
        let mut inode = Inode::new_local_file("x", ItemId::root(), FILE_MODE);
        inode.status = FileStatus::Error;
        inode.record_error("boom");

        inode.transition_status(FileStatus::LocalModified).unwrap();
        assert!(inode.last_error.is_none());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let inode = Inode::new_local_file("r.bin", ItemId::new("P"), FILE_MODE);
        let json = serde_json::to_string(&inode).unwrap();
        let back: Inode = serde_json::from_str(&json).unwrap();
        assert_eq!(inode, back);
    }

    #[test]
    fn test_package_is_not_a_directory() {
        assert!(!ItemKind::Package.is_dir());
        assert!(!ItemKind::File.is_dir());
        assert!(ItemKind::Folder.is_dir());
    }
}
