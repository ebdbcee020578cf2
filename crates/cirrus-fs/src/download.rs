//! On-demand download manager.
//!
//! Guarantees at-most-one concurrent download per item id no matter how
//! many openers race: the first caller drives the transfer, later callers
//! join the existing record and wait on its watch channel. Bytes stream
//! into the cache's staging area, are hashed incrementally, and are
//! atomically renamed into `content/` once the digest matches.
//!
//! ```text
//! ┌──────────────┐    fetch()       ┌────────────────────┐
//! │ FUSE opener  │ ───────────────► │  DownloadManager   │
//! │  (waiting)   │                  │  active: DashMap   │
//! └──────────────┘                  │  permits: Semaphore│
//!        ▲  watch::Receiver         └────────────────────┘
//!        └───────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cirrus_cache::{CacheEvictor, ContentCache};
use cirrus_core::domain::{CoreError, FileStatus, ItemId};
use cirrus_core::events::StatusBus;
use cirrus_core::ports::{DownloadOutcome, RemoteDrive, TokenSource};
use cirrus_store::MetadataStore;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::offline::ConnectivityMonitor;
use crate::tree::InodeGraph;

/// Transient-failure attempts per fetch.
const MAX_ATTEMPTS: u32 = 4;

/// First backoff step.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// A failed fetch is answered from this cooldown window without retrying.
const ERROR_COOLDOWN: Duration = Duration::from_secs(10);

/// Concurrent transfer limit.
const MAX_CONCURRENT: usize = 8;

/// Lifecycle of one download record.
#[derive(Debug, Clone)]
enum Phase {
    Queued,
    Downloading,
    Done,
    Errored(CoreError),
    Cancelled,
}

/// Shared record of one in-flight download.
struct DownloadSlot {
    tx: watch::Sender<Phase>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

impl DownloadSlot {
    fn new() -> Self {
        let (tx, _) = watch::channel(Phase::Queued);
        Self {
            tx,
            waiters: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
        }
    }

    fn finish(&self, phase: Phase) {
        let _ = self.tx.send(phase);
    }
}

/// Single-flight downloader for file bodies.
pub struct DownloadManager {
    remote: Arc<dyn RemoteDrive>,
    tokens: Arc<dyn TokenSource>,
    tree: Arc<InodeGraph>,
    cache: Arc<ContentCache>,
    evictor: Arc<CacheEvictor>,
    store: Arc<MetadataStore>,
    bus: StatusBus,
    net: Arc<ConnectivityMonitor>,
    active: DashMap<ItemId, Arc<DownloadSlot>>,
    recent_errors: DashMap<ItemId, (CoreError, Instant)>,
    permits: Arc<Semaphore>,
}

impl DownloadManager {
    /// Wires the manager to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteDrive>,
        tokens: Arc<dyn TokenSource>,
        tree: Arc<InodeGraph>,
        cache: Arc<ContentCache>,
        evictor: Arc<CacheEvictor>,
        store: Arc<MetadataStore>,
        bus: StatusBus,
        net: Arc<ConnectivityMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            tokens,
            tree,
            cache,
            evictor,
            store,
            bus,
            net,
            active: DashMap::new(),
            recent_errors: DashMap::new(),
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT)),
        })
    }

    /// Number of transfers currently in flight (diagnostics).
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Ensures a verified body exists in the cache for `id`, downloading
    /// if necessary. Concurrent callers for the same id share one
    /// transfer. Directory opens never come through here.
    pub async fn fetch(self: &Arc<Self>, id: &ItemId) -> Result<(), CoreError> {
        let record = self
            .tree
            .read(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if record.is_dir() {
            return Ok(());
        }
        // a clean cached body needs no transfer
        if record.status.has_local_body() && self.cache.exists(id) {
            return Ok(());
        }

        // an error within the cooldown answers without another attempt
        if let Some(entry) = self.recent_errors.get(id) {
            let (error, at) = entry.value().clone();
            if at.elapsed() < ERROR_COOLDOWN {
                debug!(id = %id, "returning cached download error within cooldown");
                return Err(error);
            }
            drop(entry);
            self.recent_errors.remove(id);
        }

        let (slot, started) = self.join_or_start(id);
        if started {
            let manager = Arc::clone(self);
            let slot_for_task = Arc::clone(&slot);
            let id = id.clone();
            tokio::spawn(async move {
                manager.drive_transfer(id, slot_for_task).await;
            });
        }

        let guard = WaiterGuard {
            manager: Arc::clone(self),
            id: id.clone(),
            slot,
            done: false,
        };
        guard.wait().await
    }

    /// Schedules a background re-download (pinned items whose remote body
    /// changed). Errors are logged, not surfaced.
    pub fn request_background(self: &Arc<Self>, id: &ItemId) {
        let manager = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.fetch(&id).await {
                warn!(id = %id, %error, "background download failed");
            }
        });
    }

    fn join_or_start(&self, id: &ItemId) -> (Arc<DownloadSlot>, bool) {
        use dashmap::mapref::entry::Entry;
        match self.active.entry(id.clone()) {
            Entry::Occupied(entry) => {
                let slot = Arc::clone(entry.get());
                slot.waiters.fetch_add(1, Ordering::SeqCst);
                debug!(id = %id, "joining in-flight download");
                (slot, false)
            }
            Entry::Vacant(entry) => {
                let slot = Arc::new(DownloadSlot::new());
                entry.insert(Arc::clone(&slot));
                (slot, true)
            }
        }
    }

    /// The transfer task: runs once per record, owned by the first caller.
    async fn drive_transfer(self: Arc<Self>, id: ItemId, slot: Arc<DownloadSlot>) {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                slot.finish(Phase::Cancelled);
                self.active.remove(&id);
                return;
            }
        };
        slot.finish(Phase::Downloading);
        self.transition(&id, FileStatus::Downloading).await;

        let outcome = tokio::select! {
            _ = slot.cancel.cancelled() => Err(CoreError::Cancelled),
            result = self.transfer_with_retry(&id, &slot) => result,
        };

        match outcome {
            Ok(()) => {
                self.transition(&id, FileStatus::Cached).await;
                info!(id = %id, "download complete");
                slot.finish(Phase::Done);
            }
            Err(CoreError::Cancelled) => {
                debug!(id = %id, "download cancelled by last waiter");
                self.transition(&id, FileStatus::Cloud).await;
                slot.finish(Phase::Cancelled);
            }
            Err(CoreError::NotFound(message)) => {
                // the remote no longer has the item
                let error = CoreError::NotFound(message);
                if let Err(err) = self.tree.mark_deleted(&id) {
                    warn!(id = %id, error = %err, "could not tombstone missing item");
                }
                self.recent_errors.insert(id.clone(), (error.clone(), Instant::now()));
                slot.finish(Phase::Errored(error));
            }
            Err(error) => {
                warn!(id = %id, %error, "download failed");
                self.transition(&id, FileStatus::Error).await;
                if let Some(inode) = self.tree.get(&id) {
                    let record = inode.update(|r| {
                        r.last_error = Some(error.to_string());
                        r.clone()
                    });
                    if let Err(err) = self.store.put_inode(&record).await {
                        warn!(id = %id, error = %err, "could not persist error state");
                    }
                }
                self.recent_errors.insert(id.clone(), (error.clone(), Instant::now()));
                slot.finish(Phase::Errored(error));
            }
        }
        // guard against racing a newer record for the same id
        self.active.remove_if(&id, |_, v| Arc::ptr_eq(v, &slot));
    }

    /// Attempt loop with exponential backoff and jitter. The classifier:
    /// 401 refreshes the token and retries once; transport errors and
    /// post-200 hash mismatches back off; everything else is final.
    async fn transfer_with_retry(
        &self,
        id: &ItemId,
        slot: &DownloadSlot,
    ) -> Result<(), CoreError> {
        let mut auth_retried = false;
        let mut attempt: u32 = 0;
        loop {
            if slot.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            match self.transfer_once(id).await {
                Ok(()) => return Ok(()),
                Err(CoreError::AuthExpired) if !auth_retried => {
                    auth_retried = true;
                    debug!(id = %id, "401 during download, refreshing token");
                    self.tokens.refresh().await?;
                }
                Err(error @ CoreError::Transient(_)) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(CoreError::Exhausted(error.to_string()));
                    }
                    let backoff = backoff_with_jitter(attempt);
                    debug!(id = %id, attempt, backoff_ms = backoff.as_millis() as u64, "download backoff");
                    tokio::select! {
                        _ = slot.cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(CoreError::RateLimited { retry_after }) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(CoreError::Exhausted("rate limited".into()));
                    }
                    tokio::select! {
                        _ = slot.cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// One conditional download: 304 leaves the cached body in place, 200
    /// streams into staging with incremental hashing and atomic promote.
    async fn transfer_once(&self, id: &ItemId) -> Result<(), CoreError> {
        let record = self
            .tree
            .read(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let conditional = if self.cache.exists(id) {
            record.etag.as_deref()
        } else {
            None
        };

        let result = self.remote.download(id, conditional).await;
        self.net.record_result(&result);

        match result? {
            DownloadOutcome::NotModified => {
                debug!(id = %id, "304: cached body is current");
                Ok(())
            }
            DownloadOutcome::Full(bytes) => {
                let mut staged = self.cache.begin_staging(id)?;
                staged.write(&bytes)?;
                // verify against the server-reported hash when we have one
                let digest = staged.commit(record.hash.as_deref())?;
                let size = bytes.len() as u64;
                self.evictor.touch(id, size);
                if let Some(slot) = self.tree.get(id) {
                    let updated = slot.update(|r| {
                        r.size = size;
                        r.hash = Some(digest.clone());
                        r.clone()
                    });
                    self.store.put_inode(&updated).await.map_err(CoreError::from)?;
                }
                Ok(())
            }
        }
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

/// Tracks one waiter; dropping the guard before completion releases the
/// waiter's claim, and the last such release aborts the transfer.
struct WaiterGuard {
    manager: Arc<DownloadManager>,
    id: ItemId,
    slot: Arc<DownloadSlot>,
    done: bool,
}

impl WaiterGuard {
    async fn wait(mut self) -> Result<(), CoreError> {
        let mut rx = self.slot.tx.subscribe();
        loop {
            let phase = rx.borrow_and_update().clone();
            match phase {
                Phase::Done => {
                    self.done = true;
                    return Ok(());
                }
                Phase::Errored(error) => {
                    self.done = true;
                    return Err(error);
                }
                Phase::Cancelled => {
                    self.done = true;
                    return Err(CoreError::Cancelled);
                }
                Phase::Queued | Phase::Downloading => {}
            }
            if rx.changed().await.is_err() {
                self.done = true;
                return Err(CoreError::Cancelled);
            }
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let remaining = self.slot.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.done {
            return;
        }
        if remaining == 0 {
            // last waiter walked away: abort the transfer
            self.slot.cancel.cancel();
            self.manager
                .active
                .remove_if(&self.id, |_, v| Arc::ptr_eq(v, &self.slot));
        }
    }
}

/// Exponential backoff with up to 25% random jitter, capped.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
    (base + Duration::from_millis(jitter)).min(BACKOFF_CAP)
}
