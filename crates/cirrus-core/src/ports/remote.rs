//! Remote drive port (driven/secondary port)
//!
//! The narrow, typed surface over the remote Graph-style API. The concrete
//! implementation lives in `cirrus-graph`; tests substitute an in-memory
//! fake. Retry policy lives *above* this contract in the download, upload,
//! and delta managers: implementations report precondition failures (412),
//! conflicts (409), auth failures (401), rate limits (429 with
//! `Retry-After`), and transport errors distinctly and never retry
//! internally.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::domain::{CoreError, ItemId, ItemKind};

/// Metadata of one remote item as reported by the server
///
/// This is a port-level DTO; the inode graph maps it onto [`crate::domain::Inode`]
/// records during reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    /// Server-assigned id
    pub id: ItemId,
    /// Item name (case preserved)
    pub name: String,
    /// Parent folder id; `None` for the drive root
    pub parent_id: Option<ItemId>,
    /// Size in bytes (0 for folders and tombstones)
    pub size: u64,
    /// Version token
    pub etag: Option<String>,
    /// QuickXOR content hash (base64); `None` for folders
    pub hash: Option<String>,
    /// MIME type; `None` for folders
    pub mime: Option<String>,
    /// Creation timestamp
    pub created: Option<DateTime<Utc>>,
    /// Last modification timestamp
    pub modified: Option<DateTime<Utc>>,
    /// File, folder, or package
    pub kind: ItemKind,
    /// True if this entry is a tombstone in a delta feed
    pub deleted: bool,
}

/// One page of a folder listing
#[derive(Debug, Clone)]
pub struct ChildPage {
    /// The children on this page
    pub items: Vec<RemoteItem>,
    /// Opaque token for the next page, absent on the last page
    pub next_page: Option<String>,
}

/// One page of the change feed
#[derive(Debug, Clone)]
pub struct DeltaPage {
    /// Changed items in arrival order, deletions included
    pub items: Vec<RemoteItem>,
    /// Token for the next page within this poll, if any
    pub next_page: Option<String>,
    /// Final cursor, present only on the last page; persisting it ends the
    /// poll until the next tick
    pub final_cursor: Option<String>,
}

/// Result of a conditional content download
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// Fresh content (HTTP 200)
    Full(Bytes),
    /// The caller's ETag still matches (HTTP 304); no bytes transferred
    NotModified,
}

/// Server response to creating an upload session
#[derive(Debug, Clone)]
pub struct UploadSessionInfo {
    /// Absolute URL chunks are PUT to
    pub upload_url: String,
    /// When the session expires server-side
    pub expires: Option<DateTime<Utc>>,
    /// Required chunk alignment in bytes; chunk sizes must be multiples
    pub chunk_alignment: u64,
}

/// Server response to one chunk
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Intermediate chunk accepted; the server expects this offset next
    Accepted {
        /// Next expected byte offset
        next_offset: u64,
    },
    /// Final chunk: the item now exists with this metadata
    Complete(RemoteItem),
}

/// Behavior when an upload target name already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictBehavior {
    /// Reject with a conflict error
    Fail,
    /// Overwrite the existing item
    Replace,
    /// Let the server pick a non-colliding name
    Rename,
}

/// Addressing for uploads: an existing item or a new child
#[derive(Debug, Clone)]
pub enum UploadTarget {
    /// Overwrite an existing item by id
    Item(ItemId),
    /// Create a new child under `parent`
    ChildOf {
        /// Parent folder id
        parent: ItemId,
        /// New item name
        name: String,
    },
}

/// Fields of a metadata PATCH
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    /// New name, if renaming
    pub name: Option<String>,
    /// New parent id, if moving
    pub parent_id: Option<ItemId>,
}

/// Result of a connectivity probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    /// The remote answered
    Reachable,
    /// The remote did not answer
    Unreachable,
}

/// Port trait for the remote drive API
///
/// All operations are fallible with [`CoreError`] kinds; implementations
/// map transport and HTTP status distinctions onto them without retrying.
#[async_trait::async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Fetches one item's metadata by id.
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, CoreError>;

    /// Fetches one item's metadata by drive-root-relative path.
    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, CoreError>;

    /// Lists one page of a folder's children.
    async fn list_children(
        &self,
        id: &ItemId,
        page: Option<&str>,
    ) -> Result<ChildPage, CoreError>;

    /// Downloads content, conditionally when `if_none_match` is given.
    async fn download(
        &self,
        id: &ItemId,
        if_none_match: Option<&str>,
    ) -> Result<DownloadOutcome, CoreError>;

    /// Uploads a small body in a single request. `if_match` makes the write
    /// conditional on the current server ETag.
    async fn upload_small(
        &self,
        target: &UploadTarget,
        body: Bytes,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError>;

    /// Creates a resumable upload session.
    async fn create_upload_session(
        &self,
        target: &UploadTarget,
        behavior: ConflictBehavior,
    ) -> Result<UploadSessionInfo, CoreError>;

    /// Uploads one chunk to an open session.
    async fn put_chunk(
        &self,
        upload_url: &str,
        chunk: Bytes,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome, CoreError>;

    /// Abandons an open upload session.
    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), CoreError>;

    /// Creates an empty folder under `parent`. Folders have no body, so
    /// this is a direct metadata call rather than an upload.
    async fn create_folder(&self, parent: &ItemId, name: &str) -> Result<RemoteItem, CoreError>;

    /// Patches item metadata (rename/move), conditionally on `if_match`.
    async fn patch(
        &self,
        id: &ItemId,
        fields: &ItemPatch,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError>;

    /// Deletes an item, conditionally on `if_match`.
    async fn delete(&self, id: &ItemId, if_match: Option<&str>) -> Result<(), CoreError>;

    /// Fetches one page of the change feed. `cursor` is `None` for the
    /// initial full enumeration, a next-page token mid-poll, or the
    /// persisted final cursor between polls.
    async fn delta(&self, drive_id: &str, cursor: Option<&str>) -> Result<DeltaPage, CoreError>;

    /// Cheap connectivity probe; never errors.
    async fn probe(&self) -> Reachability;
}
