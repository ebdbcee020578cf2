//! Upload session records
//!
//! A session is created when a written file is closed (or fsynced) and
//! persisted to the `uploads` table before any network traffic, so a crash
//! at any point can be repaired by replay: incomplete sessions are
//! re-ingested at startup with `Recovery` priority and resume from their
//! persisted offset.

use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// Priority classes for the upload queue, highest first.
///
/// `Interactive` is an explicit fsync the caller is waiting on;
/// `Foreground` is the close of a written file; `Background` is
/// delta-driven work on pinned items; `Recovery` is a session resumed
/// after restart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UploadPriority {
    /// Resumed after restart; drains below fresh work
    Recovery = 0,
    /// Delta-driven rehydration of pinned items
    Background = 1,
    /// Close of a locally written file
    Foreground = 2,
    /// Explicit fsync with a waiting caller
    Interactive = 3,
}

/// Transfer strategy chosen from the file size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Single conditional PUT (size ≤ the small-upload cutoff)
    Small,
    /// Resumable multi-chunk upload session
    Chunked,
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    /// Queued, not yet picked up by a worker
    Pending,
    /// A worker currently owns this session (at most one per inode)
    InFlight,
    /// Finished; the record is deleted right after this state is observed
    Completed,
    /// Failed past the retry budget; kept for operator retry
    Errored,
    /// Cancelled (e.g. the inode was unlinked)
    Cancelled,
}

/// Durable record of one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Target inode (may still carry a local-only id for creates)
    pub item_id: ItemId,
    /// Parent folder at queue time, used for the create form of uploads
    pub parent_id: ItemId,
    /// Item name at queue time
    pub name: String,
    /// Small single PUT or chunked session
    pub strategy: UploadStrategy,
    /// Session URL once allocated by the server (chunked only)
    pub upload_url: Option<String>,
    /// Byte offset of the next chunk; bytes in [0, offset) are never re-sent
    pub offset: u64,
    /// Total content length
    pub total: u64,
    /// ETag observed at queue time; `None` for new files. On completion the
    /// server must still report this ETag, else conflict resolution runs.
    pub source_etag: Option<String>,
    /// QuickXOR hash (base64) of the queued content
    pub hash: String,
    /// Transient-failure retries consumed so far
    pub retries: u32,
    /// Lifecycle state
    pub state: UploadState,
    /// Queue priority class
    pub priority: UploadPriority,
    /// Message of the last failure, if any
    pub error: Option<String>,
}

impl UploadSession {
    /// Builds a pending session snapshotting the inode's identity fields.
    pub fn new(
        item_id: ItemId,
        parent_id: ItemId,
        name: impl Into<String>,
        total: u64,
        small_cutoff: u64,
        source_etag: Option<String>,
        hash: impl Into<String>,
        priority: UploadPriority,
    ) -> Self {
        let strategy = if total <= small_cutoff {
            UploadStrategy::Small
        } else {
            UploadStrategy::Chunked
        };
        Self {
            item_id,
            parent_id,
            name: name.into(),
            strategy,
            upload_url: None,
            offset: 0,
            total,
            source_etag,
            hash: hash.into(),
            retries: 0,
            state: UploadState::Pending,
            priority,
            error: None,
        }
    }

    /// True for the create form: the item does not exist remotely yet.
    pub fn is_create(&self) -> bool {
        self.item_id.is_local()
    }

    /// True if a restart should re-ingest this record.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self.state,
            UploadState::Pending | UploadState::InFlight | UploadState::Errored
        )
    }
}
