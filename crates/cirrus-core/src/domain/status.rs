//! Per-inode file-status state machine
//!
//! ```text
//!  Cloud ──open──▶ Downloading ──ok──▶ Cached
//!    ▲                  │
//!    │                  └──err──▶ Error ──retry──▶ Downloading
//!    │
//!  Cached ──write──▶ LocalModified ──close/fsync──▶ Uploading
//!                                                    │
//!                                                    ├──ok──▶ Cached
//!                                                    ├──etag-fail──▶ Conflict
//!                                                    └──err (budget)──▶ Error
//!  Cached ──remote-change──▶ Cloud (body invalidated)
//!  LocalModified ──remote-change──▶ OutOfSync
//!  Uploading     ──remote-change──▶ OutOfSync
//! ```
//!
//! These values are authoritative: desktop integrations and the xattr
//! surface observe only this enum. Every transition is published on the
//! status bus, and the published sequence for one inode is a prefix of a
//! valid path through this machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::CoreError;

/// Synchronization status of a single inode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Metadata only; the body lives in the cloud. Opening downloads it.
    #[default]
    Cloud,
    /// A download for this inode is in flight
    Downloading,
    /// Body cached locally and identical to the remote version
    Cached,
    /// Body differs locally; an upload is pending
    LocalModified,
    /// An upload for this inode is in flight
    Uploading,
    /// The remote changed while local changes were pending
    OutOfSync,
    /// A transfer failed past its retry budget; recoverable by retry
    Error,
    /// An ETag conflict was detected; recoverable by user action
    Conflict,
}

impl FileStatus {
    /// Returns true if a body is expected to exist in the content cache.
    pub fn has_local_body(&self) -> bool {
        matches!(
            self,
            FileStatus::Cached
                | FileStatus::LocalModified
                | FileStatus::Uploading
                | FileStatus::OutOfSync
        )
    }

    /// Returns true for the steady states that require user or timed retry.
    pub fn needs_attention(&self) -> bool {
        matches!(self, FileStatus::Error | FileStatus::Conflict)
    }

    /// Returns true while a transfer is in flight for this inode.
    pub fn is_transferring(&self) -> bool {
        matches!(self, FileStatus::Downloading | FileStatus::Uploading)
    }

    /// The stable string form used on the IPC bus and the xattr surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Cloud => "cloud",
            FileStatus::Downloading => "downloading",
            FileStatus::Cached => "cached",
            FileStatus::LocalModified => "local_modified",
            FileStatus::Uploading => "uploading",
            FileStatus::OutOfSync => "out_of_sync",
            FileStatus::Error => "error",
            FileStatus::Conflict => "conflict",
        }
    }

    /// Checks whether the machine permits moving to `target`.
    ///
    /// Self-transitions are permitted (and treated as no-ops by callers).
    pub fn can_transition_to(&self, target: FileStatus) -> bool {
        use FileStatus::*;

        if *self == target {
            return true;
        }

        matches!(
            (*self, target),
            // Opening a ghost starts a download
            (Cloud, Downloading)
            // Download outcomes; cancellation falls back to Cloud
            | (Downloading, Cached)
            | (Downloading, Error)
            | (Downloading, Cloud)
            // Local writes dirty a cached body; remote changes invalidate it
            | (Cached, LocalModified)
            | (Cached, Cloud)
            // Dispatching an upload; remote change while dirty
            | (LocalModified, Uploading)
            | (LocalModified, OutOfSync)
            // Upload outcomes
            | (Uploading, Cached)
            | (Uploading, Conflict)
            | (Uploading, Error)
            | (Uploading, OutOfSync)
            | (Uploading, LocalModified)
            // OutOfSync resolves when the in-flight upload completes
            | (OutOfSync, Cached)
            | (OutOfSync, Conflict)
            | (OutOfSync, Uploading)
            // Error recovers only by explicit retry or a new local write
            | (Error, Downloading)
            | (Error, Uploading)
            | (Error, LocalModified)
            | (Error, Cloud)
            // A conflicted id is refreshed from the remote
            | (Conflict, Cloud)
            | (Conflict, Downloading)
        )
    }

    /// Validated transition.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Invalid` if the machine forbids the move.
    pub fn transition_to(&mut self, target: FileStatus) -> Result<(), CoreError> {
        if !self.can_transition_to(target) {
            return Err(CoreError::Invalid(format!(
                "invalid status transition {self} -> {target}"
            )));
        }
        *self = target;
        Ok(())
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
