//! Durable upload manager.
//!
//! A priority queue (Interactive > Foreground > Background > Recovery)
//! drained by a bounded worker pool. Sessions are persisted to the
//! `uploads` table before any network traffic and after every accepted
//! chunk, so a crash resumes at the recorded offset without re-sending a
//! byte below it. No two workers ever run sessions for the same inode id.
//!
//! Conflict handling: a small upload carries `If-Match` with the ETag
//! captured at queue time; a chunked update verifies that ETag against
//! the live item before opening the session. A mismatch preserves the
//! local bytes under a conflict-stamped sibling name and re-queues them
//! as a create, while the original id is refreshed from the remote.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use std::sync::Arc;

use bytes::Bytes;
use cirrus_cache::ContentCache;
use cirrus_core::domain::name::conflict_name;
use cirrus_core::domain::{
    CoreError, FileStatus, ItemId, ItemKind, UploadPriority, UploadSession, UploadState,
    UploadStrategy,
};
use cirrus_core::events::StatusBus;
use cirrus_core::ports::{
    ChunkOutcome, ConflictBehavior, RemoteDrive, RemoteItem, TokenSource, UploadTarget,
};
use cirrus_store::MetadataStore;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handles::HandleTable;
use crate::offline::ConnectivityMonitor;
use crate::tree::InodeGraph;

/// Backoff base for transient upload failures.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Tuning knobs taken from the mount configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Bodies at or below this size take the single-PUT path
    pub small_cutoff: u64,
    /// Preferred chunk size; rounded down to the session alignment
    pub chunk_size: u64,
    /// Transient-failure budget per session
    pub max_retries: u32,
    /// Backoff ceiling
    pub backoff_cap: Duration,
    /// Worker pool size
    pub workers: usize,
}

impl UploadConfig {
    /// Derives the knobs from the loaded configuration.
    pub fn from_config(config: &cirrus_core::config::Config) -> Self {
        Self {
            small_cutoff: config.small_upload_cutoff,
            chunk_size: config.chunk_size,
            max_retries: config.upload_max_retries,
            backoff_cap: Duration::from_secs(config.upload_backoff_cap),
            workers: 4,
        }
    }
}

/// Queue entry: priority class first, FIFO within a class.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedUpload {
    priority: UploadPriority,
    seq: u64,
    id: ItemId,
}

impl Ord for QueuedUpload {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedUpload {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedUpload>,
    next_seq: u64,
}

/// The outcome broadcast to fsync waiters.
type CompletionSignal = watch::Sender<Option<Result<(), CoreError>>>;

/// Priority-queued, durable, conflict-detecting uploader.
pub struct UploadManager {
    remote: Arc<dyn RemoteDrive>,
    tokens: Arc<dyn TokenSource>,
    tree: Arc<InodeGraph>,
    cache: Arc<ContentCache>,
    store: Arc<MetadataStore>,
    bus: StatusBus,
    net: Arc<ConnectivityMonitor>,
    handles: Arc<HandleTable>,
    config: UploadConfig,
    queue: Mutex<QueueState>,
    in_flight: DashMap<ItemId, CancellationToken>,
    signals: DashMap<ItemId, CompletionSignal>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl UploadManager {
    /// Wires the manager to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteDrive>,
        tokens: Arc<dyn TokenSource>,
        tree: Arc<InodeGraph>,
        cache: Arc<ContentCache>,
        store: Arc<MetadataStore>,
        bus: StatusBus,
        net: Arc<ConnectivityMonitor>,
        handles: Arc<HandleTable>,
        config: UploadConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            tokens,
            tree,
            cache,
            store,
            bus,
            net,
            handles,
            config,
            queue: Mutex::new(QueueState::default()),
            in_flight: DashMap::new(),
            signals: DashMap::new(),
            notify: Notify::new(),
            shutdown,
        })
    }

    /// Spawns the worker pool.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let manager = Arc::clone(self);
                tokio::spawn(async move { manager.worker_loop(worker).await })
            })
            .collect()
    }

    /// Queued entries not yet picked up (diagnostics).
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap().heap.len()
    }

    /// Sessions currently owned by workers (diagnostics).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    // ------------------------------------------------------------------
    // enqueue / recovery / cancellation
    // ------------------------------------------------------------------

    /// Snapshots the inode's cached body into a durable session and
    /// queues it. The file stays `LocalModified` until a worker picks the
    /// session up.
    pub async fn enqueue(&self, id: &ItemId, priority: UploadPriority) -> Result<(), CoreError> {
        let record = self
            .tree
            .read(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if record.is_dir() || record.flags.deleted {
            return Ok(());
        }
        let parent = record
            .parent
            .clone()
            .ok_or_else(|| CoreError::Invalid("cannot upload the root".into()))?;

        // the body is the source of truth for size and hash (invariant I4)
        let total = self
            .cache
            .size(id)
            .ok_or_else(|| CoreError::Storage(format!("no cached body to upload for {id}")))?;
        let hash = self.cache.hash_of(id)?;

        let source_etag = if id.is_local() { None } else { record.etag.clone() };
        let session = UploadSession::new(
            id.clone(),
            parent,
            record.name.clone(),
            total,
            self.config.small_cutoff,
            source_etag,
            hash,
            priority,
        );
        self.store.put_upload(&session).await?;

        // reset the completion signal for this round
        let (tx, _) = watch::channel(None);
        self.signals.insert(id.clone(), tx);

        self.push_queue(id.clone(), priority);
        debug!(id = %id, ?priority, total, "upload enqueued");
        Ok(())
    }

    /// Re-ingests every incomplete persisted session at `Recovery`
    /// priority, preserving offsets and upload URLs. Returns how many
    /// were restored.
    pub async fn restore(&self) -> Result<usize, CoreError> {
        let mut restored = 0usize;
        for mut session in self.store.all_uploads().await.map_err(CoreError::from)? {
            if !session.is_resumable() {
                self.store.delete_upload(&session.item_id).await?;
                continue;
            }
            if !self.tree.contains(&session.item_id) || !self.cache.exists(&session.item_id) {
                warn!(id = %session.item_id, "dropping stale session without body");
                self.store.delete_upload(&session.item_id).await?;
                continue;
            }
            session.state = UploadState::Pending;
            session.priority = UploadPriority::Recovery;
            self.store.put_upload(&session).await?;
            self.push_queue(session.item_id.clone(), UploadPriority::Recovery);
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "upload sessions re-ingested after restart");
        }
        Ok(restored)
    }

    /// Cancels any pending or in-flight upload for an inode (unlink).
    pub async fn cancel(&self, id: &ItemId) -> Result<(), CoreError> {
        if let Some(entry) = self.in_flight.get(id) {
            entry.value().cancel();
        }
        if let Some(session) = self.store.get_upload(id).await.map_err(CoreError::from)? {
            if let Some(url) = &session.upload_url {
                let _ = self.remote.cancel_upload_session(url).await;
            }
        }
        self.store.delete_upload(id).await?;
        self.finish_signal(id, Err(CoreError::Cancelled));
        Ok(())
    }

    /// Waits for the current session of `id` to finish, up to `deadline`.
    /// A timeout returns `Ok(())` to the caller (POSIX does not mandate a
    /// durability failure here); the session keeps running and errors are
    /// still reported on the status bus.
    pub async fn wait_for_completion(
        &self,
        id: &ItemId,
        deadline: Duration,
    ) -> Result<(), CoreError> {
        let Some(signal) = self.signals.get(id).map(|s| s.subscribe()) else {
            return Ok(());
        };
        let mut rx = signal;
        let wait = async {
            loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Ok(());
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                debug!(id = %id, "fsync deadline elapsed, upload continues");
                Ok(())
            }
        }
    }

    fn push_queue(&self, id: ItemId, priority: UploadPriority) {
        let mut queue = self.queue.lock().unwrap();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedUpload { priority, seq, id });
        drop(queue);
        // notify_one stores a permit, so a push between a worker's empty
        // poll and its wait is never lost
        self.notify.notify_one();
    }

    fn finish_signal(&self, id: &ItemId, result: Result<(), CoreError>) {
        if let Some(signal) = self.signals.get(id) {
            let _ = signal.send(Some(result));
        }
    }

    // ------------------------------------------------------------------
    // workers
    // ------------------------------------------------------------------

    /// Picks the highest-priority entry whose inode is not already owned
    /// by another worker, and claims it.
    fn next_eligible(&self) -> Option<(QueuedUpload, CancellationToken)> {
        let mut queue = self.queue.lock().unwrap();
        let mut stash = Vec::new();
        let mut picked = None;
        while let Some(entry) = queue.heap.pop() {
            if self.in_flight.contains_key(&entry.id) {
                stash.push(entry);
                continue;
            }
            let token = CancellationToken::new();
            self.in_flight.insert(entry.id.clone(), token.clone());
            picked = Some((entry, token));
            break;
        }
        for entry in stash {
            queue.heap.push(entry);
        }
        picked
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "upload worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            // offline: keep queueing, stop dispatching
            self.net.wait_until_connected().await;

            let Some((entry, token)) = self.next_eligible() else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.notify.notified() => {}
                }
                continue;
            };

            self.run_session(&entry.id, token).await;
            self.in_flight.remove(&entry.id);
            // a same-inode entry may have been blocked on us
            self.notify.notify_one();
        }
        debug!(worker, "upload worker stopped");
    }

    /// Runs one persisted session to completion, conflict, or error.
    async fn run_session(&self, id: &ItemId, cancel: CancellationToken) {
        let session = match self.store.get_upload(id).await {
            Ok(Some(session)) if session.is_resumable() => session,
            Ok(_) => return, // cancelled or already completed
            Err(error) => {
                warn!(id = %id, %error, "could not load session");
                return;
            }
        };

        let mut session = session;
        session.state = UploadState::InFlight;
        if let Err(error) = self.store.put_upload(&session).await {
            warn!(id = %id, %error, "could not persist in-flight state");
        }
        self.transition(id, FileStatus::Uploading).await;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            result = self.perform(&mut session, &cancel) => result,
        };

        match outcome {
            Ok(item) => self.complete(session, item).await,
            Err(CoreError::Cancelled) => {
                debug!(id = %id, "upload cancelled");
                // offsets were persisted chunk by chunk; nothing to undo
            }
            Err(CoreError::Conflict(_)) | Err(CoreError::Precondition(_)) => {
                info!(id = %id, "etag mismatch, resolving conflict");
                if let Err(error) = self.resolve_conflict(session).await {
                    warn!(id = %id, %error, "conflict resolution failed");
                    self.fail(id, error).await;
                }
            }
            Err(error) => self.fail(id, error).await,
        }
    }

    /// The transfer itself, with the retry budget applied to transient
    /// classes only.
    async fn perform(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> Result<RemoteItem, CoreError> {
        let mut auth_retried = false;
        loop {
            let attempt_result = match session.strategy {
                UploadStrategy::Small => self.send_small(session).await,
                UploadStrategy::Chunked => self.send_chunks(session, cancel).await,
            };
            self.net.record_result(&attempt_result);

            match attempt_result {
                Ok(item) => return Ok(item),
                Err(CoreError::AuthExpired) if !auth_retried => {
                    auth_retried = true;
                    self.tokens.refresh().await?;
                }
                Err(CoreError::RateLimited { retry_after }) => {
                    debug!(id = %session.item_id, delay_ms = retry_after.as_millis() as u64, "429, honoring Retry-After");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
                Err(error @ CoreError::Transient(_)) => {
                    session.retries += 1;
                    session.error = Some(error.to_string());
                    self.store.put_upload(session).await?;
                    if session.retries >= self.config.max_retries {
                        return Err(CoreError::Exhausted(error.to_string()));
                    }
                    let backoff = self.backoff(session.retries);
                    debug!(id = %session.item_id, retries = session.retries, backoff_ms = backoff.as_millis() as u64, "upload backoff");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    // offline in the meantime? park instead of burning budget
                    self.net.wait_until_connected().await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn target_for(&self, session: &UploadSession) -> UploadTarget {
        if session.is_create() {
            // names may have changed since queue time; prefer the live record
            let (parent, name) = self
                .tree
                .read(&session.item_id)
                .and_then(|r| r.parent.clone().map(|p| (p, r.name)))
                .unwrap_or_else(|| (session.parent_id.clone(), session.name.clone()));
            UploadTarget::ChildOf { parent, name }
        } else {
            UploadTarget::Item(session.item_id.clone())
        }
    }

    /// Single conditional PUT for small bodies.
    async fn send_small(&self, session: &UploadSession) -> Result<RemoteItem, CoreError> {
        let body = Bytes::from(self.cache.read_all(&session.item_id)?);
        let target = self.target_for(session);
        self.remote
            .upload_small(&target, body, session.source_etag.as_deref())
            .await
    }

    /// Chunked session upload: allocates the upload URL if absent, then
    /// streams aligned chunks from the persisted offset, persisting after
    /// every accepted chunk.
    async fn send_chunks(
        &self,
        session: &mut UploadSession,
        cancel: &CancellationToken,
    ) -> Result<RemoteItem, CoreError> {
        let mut chunk_size = aligned_chunk_size(self.config.chunk_size, ChunkAlignment::DEFAULT);
        if session.upload_url.is_none() {
            // updates get their optimistic check before the first byte
            if let Some(expected) = session.source_etag.clone() {
                let live = self.remote.get_item(&session.item_id).await?;
                if live.etag.as_deref() != Some(expected.as_str()) {
                    return Err(CoreError::Precondition(format!(
                        "etag changed from {expected:?} before session start"
                    )));
                }
            }
            let target = self.target_for(session);
            let info = self
                .remote
                .create_upload_session(&target, ConflictBehavior::Replace)
                .await?;
            session.upload_url = Some(info.upload_url.clone());
            chunk_size = aligned_chunk_size(self.config.chunk_size, info.chunk_alignment);
            debug!(id = %session.item_id, chunk_size, "upload session created");
            self.store.put_upload(session).await?;
        }
        let upload_url = session
            .upload_url
            .clone()
            .ok_or_else(|| CoreError::Invalid("session without upload URL".into()))?;

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let remaining = session.total.saturating_sub(session.offset);
            let this_chunk = remaining.min(chunk_size);
            let bytes = if this_chunk == 0 {
                Bytes::new()
            } else {
                Bytes::from(self.cache.read_at(
                    &session.item_id,
                    session.offset,
                    this_chunk as u32,
                )?)
            };

            let outcome = self
                .remote
                .put_chunk(&upload_url, bytes, session.offset, session.total)
                .await;

            match outcome {
                Ok(ChunkOutcome::Accepted { next_offset }) => {
                    session.offset = next_offset;
                    // the persist below is the crash-recovery point: a
                    // restart resumes at this offset
                    self.store.put_upload(session).await?;
                }
                Ok(ChunkOutcome::Complete(item)) => return Ok(item),
                Err(CoreError::NotFound(message)) => {
                    // the session URL expired server-side: start over
                    warn!(id = %session.item_id, "upload session expired, restarting");
                    session.upload_url = None;
                    session.offset = 0;
                    self.store.put_upload(session).await?;
                    return Err(CoreError::Transient(format!(
                        "upload session expired: {message}"
                    )));
                }
                Err(other) => return Err(other),
            }
        }
    }

    // ------------------------------------------------------------------
    // completion paths
    // ------------------------------------------------------------------

    /// Adopts the server's view after a successful transfer: remap
    /// local-only ids, record the new ETag, clear the dirty flag, and
    /// re-queue if the body changed while we were uploading.
    async fn complete(&self, session: UploadSession, item: RemoteItem) {
        let old_id = session.item_id.clone();
        let new_id = item.id.clone();

        if old_id.is_local() && old_id != new_id {
            if let Err(error) = self.cache.rename_id(&old_id, &new_id) {
                warn!(id = %old_id, %error, "could not move cached body to server id");
            }
            if let Err(error) = self.tree.remap_id(&old_id, &new_id) {
                warn!(id = %old_id, %error, "could not remap inode id");
                return;
            }
            self.handles.remap_id(&old_id, &new_id);
            if let Err(error) = self.store.delete_inode(&old_id).await {
                warn!(id = %old_id, %error, "could not drop local-only record");
            }
            if let Some(signal) = self.signals.remove(&old_id) {
                self.signals.insert(new_id.clone(), signal.1);
            }
        }
        if let Err(error) = self.store.delete_upload(&old_id).await {
            warn!(id = %old_id, %error, "could not delete completed session");
        }

        // a write that landed mid-upload keeps the file dirty
        let still_dirty = self
            .cache
            .hash_of(&new_id)
            .map(|current| current != session.hash)
            .unwrap_or(false);

        if let Some(slot) = self.tree.get(&new_id) {
            let record = slot.update(|record| {
                record.etag = item.etag.clone();
                record.hash = Some(session.hash.clone());
                record.size = session.total;
                record.flags.has_upload_error = false;
                record.flags.has_changes = still_dirty;
                record.clone()
            });
            if let Err(error) = self.store.put_inode(&record).await {
                warn!(id = %new_id, %error, "could not persist uploaded inode");
            }
        }

        if still_dirty {
            debug!(id = %new_id, "body changed during upload, re-queueing");
            self.transition(&new_id, FileStatus::LocalModified).await;
            if let Err(error) = self.enqueue(&new_id, UploadPriority::Foreground).await {
                warn!(id = %new_id, %error, "re-enqueue failed");
            }
        } else {
            self.transition(&new_id, FileStatus::Cached).await;
            info!(id = %new_id, etag = ?item.etag, "upload complete");
        }
        self.finish_signal(&new_id, Ok(()));
    }

    /// The remote changed under us: preserve the local bytes as a
    /// conflict copy queued as a create, refresh the original id.
    async fn resolve_conflict(&self, session: UploadSession) -> Result<(), CoreError> {
        let id = session.item_id.clone();
        self.transition(&id, FileStatus::Conflict).await;

        let record = self
            .tree
            .read(&id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let parent = record
            .parent
            .clone()
            .ok_or_else(|| CoreError::Invalid("conflict on root".into()))?;

        let sidestep = conflict_name(&record.name, chrono::Utc::now());
        let copy = self
            .tree
            .create_child(&parent, &sidestep, ItemKind::File, Some(record.mode))?;
        // the local bytes move to the new inode; the old id will be
        // re-downloaded from the remote on next open
        self.cache.rename_id(&id, &copy.id)?;
        let copy_record = {
            let slot = self
                .tree
                .get(&copy.id)
                .ok_or_else(|| CoreError::NotFound(copy.id.to_string()))?;
            slot.update(|r| {
                r.size = session.total;
                r.hash = Some(session.hash.clone());
                r.clone()
            })
        };
        self.store.put_inode(&copy_record).await?;
        self.store.delete_upload(&id).await?;

        // original id: local changes are gone with the body
        if let Some(slot) = self.tree.get(&id) {
            let record = slot.update(|r| {
                r.flags.has_changes = false;
                r.clone()
            });
            self.store.put_inode(&record).await?;
        }
        match self.remote.get_item(&id).await {
            Ok(item) => {
                self.tree.replace_from_remote(&item)?;
            }
            Err(error) => {
                debug!(id = %id, %error, "refresh after conflict deferred to delta");
            }
        }
        self.transition(&id, FileStatus::Cloud).await;
        self.finish_signal(&id, Err(CoreError::Conflict(format!("{id} diverged"))));

        // the preserved copy goes up as a brand-new file
        self.enqueue(&copy.id, UploadPriority::Foreground).await?;
        info!(original = %id, copy = %copy.id, name = %sidestep, "conflict copy queued");
        Ok(())
    }

    /// Terminal failure: mark the inode, keep the session for operator
    /// retry.
    async fn fail(&self, id: &ItemId, error: CoreError) {
        warn!(id = %id, %error, "upload failed past budget");
        self.transition(id, FileStatus::Error).await;
        if let Some(slot) = self.tree.get(id) {
            let record = slot.update(|record| {
                record.record_error(error.to_string());
                record.clone()
            });
            if let Err(err) = self.store.put_inode(&record).await {
                warn!(id = %id, error = %err, "could not persist failure");
            }
        }
        if let Ok(Some(mut session)) = self.store.get_upload(id).await {
            session.state = UploadState::Errored;
            session.error = Some(error.to_string());
            if let Err(err) = self.store.put_upload(&session).await {
                warn!(id = %id, error = %err, "could not persist errored session");
            }
        }
        self.finish_signal(id, Err(error));
    }

    fn backoff(&self, retries: u32) -> Duration {
        let base = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(retries.saturating_sub(1)))
            .min(self.config.backoff_cap);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        (base + Duration::from_millis(jitter)).min(self.config.backoff_cap)
    }

    /// Applies a status transition, persists it, and publishes the event.
    async fn transition(&self, id: &ItemId, target: FileStatus) {
        let Some(slot) = self.tree.get(id) else {
            return;
        };
        let changed = slot.update(|record| match record.transition_status(target) {
            Ok(changed) => Some((changed, record.clone())),
            Err(error) => {
                debug!(id = %id, %error, "suppressing invalid transition");
                None
            }
        });
        if let Some((changed, record)) = changed {
            if changed {
                if let Err(error) = self.store.put_inode(&record).await {
                    warn!(id = %id, %error, "could not persist status");
                }
                let path = self.tree.path_of(id).unwrap_or_else(|| format!("/{id}"));
                self.bus.publish(id.clone(), path, target);
            }
        }
    }
}

/// Namespace for the default alignment constant.
struct ChunkAlignment;

impl ChunkAlignment {
    /// Server-required chunk alignment (320 KiB).
    const DEFAULT: u64 = 320 * 1024;
}

/// Rounds the configured chunk size down to a multiple of the alignment,
/// never below one alignment unit.
fn aligned_chunk_size(configured: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    let aligned = configured - (configured % alignment);
    aligned.max(alignment)
}
