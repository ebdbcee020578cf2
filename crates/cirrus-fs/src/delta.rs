//! Remote change-feed reconciliation.
//!
//! Periodically polls the delta feed and applies add/modify/delete events
//! to the locally mutating tree. Four cases per item:
//!
//! 1. unknown id → insert (parent-less events wait in a retry buffer)
//! 2. tombstone → detach; open handles keep working; a locally dirty copy
//!    wins and is re-created remotely
//! 3. remote change, local clean → replace-from-remote (+ body
//!    invalidation when the content hash moved)
//! 4. remote change, local dirty or uploading → `OutOfSync`, never
//!    overwrite
//!
//! The cursor is persisted after every page; re-applying an already-seen
//! page is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cirrus_cache::{CacheEvictor, ContentCache};
use cirrus_core::domain::{CoreError, FileStatus, ItemId, UploadPriority};
use cirrus_core::events::StatusBus;
use cirrus_core::ports::{RemoteDrive, RemoteItem};
use cirrus_store::MetadataStore;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::download::DownloadManager;
use crate::offline::ConnectivityMonitor;
use crate::tree::{InodeGraph, ReplaceOutcome};
use crate::upload::UploadManager;

/// Poll-interval stretch factor while the push notifier is healthy.
const NOTIFIER_STRETCH: u32 = 4;

/// Poll cadence knobs.
#[derive(Debug, Clone)]
pub struct DeltaConfig {
    /// Drive whose feed is polled
    pub drive_id: String,
    /// Short base interval; a failed or missing notifier forces this one
    pub interval_active: Duration,
    /// Long interval, stretched further while the push notifier is healthy
    pub interval_idle: Duration,
}

/// The delta applier.
pub struct DeltaApplier {
    remote: Arc<dyn RemoteDrive>,
    tree: Arc<InodeGraph>,
    cache: Arc<ContentCache>,
    evictor: Arc<CacheEvictor>,
    store: Arc<MetadataStore>,
    bus: StatusBus,
    net: Arc<ConnectivityMonitor>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    config: DeltaConfig,
    /// Reported health of the external push-notification channel
    notifier_healthy: AtomicBool,
    /// Wakes the loop for an immediate poll
    poke: Notify,
}

impl DeltaApplier {
    /// Wires the applier to its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteDrive>,
        tree: Arc<InodeGraph>,
        cache: Arc<ContentCache>,
        evictor: Arc<CacheEvictor>,
        store: Arc<MetadataStore>,
        bus: StatusBus,
        net: Arc<ConnectivityMonitor>,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        config: DeltaConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            tree,
            cache,
            evictor,
            store,
            bus,
            net,
            downloads,
            uploads,
            config,
            notifier_healthy: AtomicBool::new(false),
            poke: Notify::new(),
        })
    }

    /// Feeds the external push notifier's health in.
    pub fn set_notifier_healthy(&self, healthy: bool) {
        self.notifier_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Requests an immediate poll.
    pub fn poke(&self) {
        self.poke.notify_waiters();
    }

    fn interval(&self) -> Duration {
        choose_interval(self.notifier_healthy.load(Ordering::Relaxed), &self.config)
    }

    /// The polling loop. While offline no polling happens; the transition
    /// back to online polls immediately.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(drive = %self.config.drive_id, "delta applier started");
        let mut net_rx = self.net.subscribe();
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if self.net.is_offline() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.net.wait_until_connected() => {
                        debug!("back online, polling immediately");
                    }
                }
            }

            if let Err(error) = self.poll_once().await {
                warn!(%error, "delta poll failed");
            }

            let interval = self.interval();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.poke.notified() => {}
                _ = tokio::time::sleep(interval) => {}
                changed = net_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("delta applier stopped");
    }

    /// Fetches and applies every page until the final cursor.
    pub async fn poll_once(&self) -> Result<(), CoreError> {
        let mut cursor = self
            .store
            .get_delta_cursor(&self.config.drive_id)
            .await
            .map_err(CoreError::from)?;
        let mut deferred: Vec<RemoteItem> = Vec::new();

        loop {
            let result = self
                .remote
                .delta(&self.config.drive_id, cursor.as_deref())
                .await;
            self.net.record_result(&result);
            let page = result?;

            for item in &page.items {
                self.apply_item(item, &mut deferred).await;
            }
            // parents may have arrived later in the same page
            self.retry_deferred(&mut deferred).await;

            match (page.next_page, page.final_cursor) {
                (Some(next), _) => {
                    // persisting the page token makes re-application of
                    // this page impossible after a crash
                    self.store
                        .put_delta_cursor(&self.config.drive_id, &next)
                        .await?;
                    cursor = Some(next);
                }
                (None, Some(done)) => {
                    self.store
                        .put_delta_cursor(&self.config.drive_id, &done)
                        .await?;
                    break;
                }
                (None, None) => break,
            }
        }

        // one extra retry window at the end of the poll, then drop
        self.retry_deferred(&mut deferred).await;
        for orphan in deferred {
            warn!(id = %orphan.id, parent = ?orphan.parent_id, "dropping delta event with unknown parent");
        }
        Ok(())
    }

    /// Forces reconciliation of a single item outside the poll cadence.
    pub async fn refresh(&self, id: &ItemId) -> Result<(), CoreError> {
        let result = self.remote.get_item(id).await;
        self.net.record_result(&result);
        let item = result?;
        let mut deferred = Vec::new();
        self.apply_item(&item, &mut deferred).await;
        Ok(())
    }

    async fn retry_deferred(&self, deferred: &mut Vec<RemoteItem>) {
        if deferred.is_empty() {
            return;
        }
        let pending = std::mem::take(deferred);
        for item in pending {
            self.apply_item(&item, deferred).await;
        }
    }

    /// Applies one change-feed event.
    async fn apply_item(&self, item: &RemoteItem, deferred: &mut Vec<RemoteItem>) {
        if item.deleted {
            self.apply_tombstone(item).await;
            return;
        }

        // the drive root has no parent and always applies
        let parent_known = match &item.parent_id {
            None => true,
            Some(parent) => self.tree.contains(parent),
        };
        if !parent_known {
            debug!(id = %item.id, "parent not yet seen, deferring event");
            deferred.push(item.clone());
            return;
        }

        let existing = self.tree.read(&item.id);
        if let Some(record) = &existing {
            // our own upload echoes back with the etag we already hold
            if record.etag.is_some() && record.etag == item.etag {
                return;
            }

            let upload_pending = matches!(self.store.get_upload(&item.id).await, Ok(Some(_)));
            if record.flags.has_changes || upload_pending {
                debug!(id = %item.id, "remote changed under local edits");
                self.transition(&item.id, FileStatus::OutOfSync).await;
                return;
            }
        }

        match self.tree.replace_from_remote(item) {
            Ok(ReplaceOutcome::Created) => {
                if let Some(record) = self.tree.read(&item.id) {
                    if let Err(error) = self.store.put_inode(&record).await {
                        warn!(id = %item.id, %error, "could not persist new inode");
                    }
                }
            }
            Ok(ReplaceOutcome::Updated { content_changed }) => {
                let record = self.tree.read(&item.id);
                if content_changed {
                    // the cached body no longer matches the remote
                    if let Err(error) = self.cache.delete(&item.id) {
                        warn!(id = %item.id, %error, "could not invalidate body");
                    }
                    self.evictor.forget(&item.id);
                    self.transition(&item.id, FileStatus::Cloud).await;

                    if record.as_ref().is_some_and(|r| r.flags.pinned) {
                        debug!(id = %item.id, "pinned body changed, scheduling re-download");
                        self.downloads.request_background(&item.id);
                    }
                }
                if let Some(record) = self.tree.read(&item.id) {
                    if let Err(error) = self.store.put_inode(&record).await {
                        warn!(id = %item.id, %error, "could not persist updated inode");
                    }
                }
            }
            Ok(ReplaceOutcome::Unchanged) => {}
            Err(CoreError::NameConflict(name)) => {
                // the remote owns the name: sidestep the local-only sibling
                if let Err(error) = self.sidestep_local_sibling(item, &name).await {
                    warn!(id = %item.id, %error, "could not sidestep local sibling");
                }
            }
            Err(error) => {
                warn!(id = %item.id, %error, "could not apply delta event");
            }
        }
    }

    /// Remote deletions: open handles keep working, a dirty local copy
    /// wins and is re-created remotely under a fresh local id.
    async fn apply_tombstone(&self, item: &RemoteItem) {
        let Some(record) = self.tree.read(&item.id) else {
            // deleting something we never knew is a no-op (idempotence)
            return;
        };

        if record.flags.has_changes {
            info!(id = %item.id, "remote deleted a locally modified file, local copy wins");
            let fresh = ItemId::new_local();
            if let Err(error) = self.cache.rename_id(&item.id, &fresh) {
                warn!(id = %item.id, %error, "could not move body to local id");
                return;
            }
            if let Err(error) = self.tree.remap_id(&item.id, &fresh) {
                warn!(id = %item.id, %error, "could not remap to local id");
                return;
            }
            if let Some(slot) = self.tree.get(&fresh) {
                let updated = slot.update(|r| {
                    r.etag = None;
                    r.clone()
                });
                if let Err(error) = self.store.put_inode(&updated).await {
                    warn!(id = %fresh, %error, "could not persist resurrected inode");
                }
            }
            let _ = self.store.delete_inode(&item.id).await;
            let _ = self.store.delete_upload(&item.id).await;
            if let Err(error) = self.uploads.enqueue(&fresh, UploadPriority::Foreground).await {
                warn!(id = %fresh, %error, "could not queue re-creation");
            }
            return;
        }

        if let Err(error) = self.tree.mark_deleted(&item.id) {
            warn!(id = %item.id, %error, "could not tombstone inode");
            return;
        }
        let _ = self.store.delete_upload(&item.id).await;
        if self.tree.remove_if_unused(&item.id) {
            // no handles: the body goes now; otherwise last release cleans up
            if let Err(error) = self.cache.delete(&item.id) {
                warn!(id = %item.id, %error, "could not drop cached body");
            }
            self.evictor.forget(&item.id);
            if let Err(error) = self.store.delete_inode(&item.id).await {
                warn!(id = %item.id, %error, "could not drop inode record");
            }
        } else if let Err(error) = self.store.put_inode(&self.tree.read(&item.id).unwrap_or(record)).await {
            warn!(id = %item.id, %error, "could not persist tombstone");
        }
    }

    /// A remote item claims a name a local-only sibling holds: the remote
    /// wins, the local file moves to a conflict-stamped name.
    async fn sidestep_local_sibling(
        &self,
        item: &RemoteItem,
        folded_name: &str,
    ) -> Result<(), CoreError> {
        let Some(parent) = item.parent_id.clone() else {
            return Err(CoreError::Invalid("sidestep at root".into()));
        };
        let Some(local_id) = self.tree.lookup_child(&parent, folded_name) else {
            return Err(CoreError::NotFound(folded_name.to_string()));
        };
        let local = self
            .tree
            .read(&local_id)
            .ok_or_else(|| CoreError::NotFound(local_id.to_string()))?;
        if !local_id.is_local() {
            // a true server-side duplicate would be a remote bug; give up
            return Err(CoreError::NameConflict(folded_name.to_string()));
        }

        let sidestep = cirrus_core::domain::name::conflict_name(&local.name, chrono::Utc::now());
        self.tree.rename(&local_id, &parent, &sidestep)?;
        if let Some(record) = self.tree.read(&local_id) {
            self.store.put_inode(&record).await?;
        }
        info!(id = %local_id, name = %sidestep, "local sibling renamed for incoming remote item");

        // now the remote item applies cleanly
        self.tree.replace_from_remote(item)?;
        if let Some(record) = self.tree.read(&item.id) {
            self.store.put_inode(&record).await?;
        }
        Ok(())
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

/// Adaptive cadence: a healthy push notifier stretches polling far out; a
/// failed or missing notifier forces the short interval so changes are
/// still noticed promptly.
fn choose_interval(notifier_healthy: bool, config: &DeltaConfig) -> Duration {
    if notifier_healthy {
        config.interval_idle * NOTIFIER_STRETCH
    } else {
        config.interval_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeltaConfig {
        DeltaConfig {
            drive_id: "me".into(),
            interval_active: Duration::from_secs(5),
            interval_idle: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_missing_notifier_forces_short_interval() {
        assert_eq!(choose_interval(false, &config()), Duration::from_secs(5));
    }

    #[test]
    fn test_healthy_notifier_stretches_polling() {
        let interval = choose_interval(true, &config());
        assert_eq!(interval, Duration::from_secs(60) * NOTIFIER_STRETCH);
        // losing the notifier drops straight back to the short cadence
        assert!(choose_interval(false, &config()) < interval);
    }
}
