//! The FS operation layer.
//!
//! Translates filesystem requests (as issued by the FUSE protocol
//! adapter) into calls on the inode graph, content cache, and transfer
//! managers, enforcing the invariants along the way. Each operation runs
//! under a bounded request context with a stable request id; remote-
//! touching steps honor the configured per-request timeout.

use std::sync::Arc;
use std::time::Duration;

use cirrus_cache::{CacheEvictor, ContentCache};
use cirrus_core::config::Config;
use cirrus_core::domain::{
    CoreError, FileStatus, Inode, ItemId, ItemKind, UploadPriority,
};
use cirrus_core::events::StatusBus;
use cirrus_core::ports::{ItemPatch, RemoteDrive, TokenSource};
use cirrus_store::{DatabasePool, MetadataStore};
use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delta::{DeltaApplier, DeltaConfig};
use crate::download::DownloadManager;
use crate::handles::HandleTable;
use crate::offline::ConnectivityMonitor;
use crate::tree::InodeGraph;
use crate::upload::{UploadConfig, UploadManager};
use crate::xattr;

/// Cadence of the cache-eviction sweep.
const EVICTION_SWEEP: Duration = Duration::from_secs(60);

/// Construction options beyond the capabilities.
pub struct FilesystemOptions {
    /// The mount configuration
    pub config: Config,
}

/// The mount-scoped core object.
///
/// Owns the durable store, the content cache, the inode graph, all four
/// managers, and the status bus. The remote client and the token source
/// are injected capabilities so every scenario can run against in-memory
/// fakes.
pub struct Filesystem {
    config: Config,
    tree: Arc<InodeGraph>,
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    evictor: Arc<CacheEvictor>,
    remote: Arc<dyn RemoteDrive>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    delta: Arc<DeltaApplier>,
    net: Arc<ConnectivityMonitor>,
    bus: StatusBus,
    handles: Arc<HandleTable>,
    /// Ids whose remote delete is deferred to the last handle close
    pending_remote_delete: DashSet<ItemId>,
    shutdown: CancellationToken,
}

impl Filesystem {
    /// Builds the core for one mount.
    ///
    /// Loads persisted inodes (falling back to the offline snapshot when
    /// the main table is empty), re-ingests incomplete upload sessions at
    /// `Recovery` priority, and seeds the eviction index from the cache.
    pub async fn new(
        options: FilesystemOptions,
        pool: &DatabasePool,
        remote: Arc<dyn RemoteDrive>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Arc<Self>, CoreError> {
        let config = options.config;
        config.validate()?;

        let store = Arc::new(MetadataStore::new(pool));
        let cache = Arc::new(
            ContentCache::new(config.content_dir(), config.tmp_dir())
                .map_err(CoreError::from)?,
        );

        let mut records = store.all_inodes().await.map_err(CoreError::from)?;
        if records.is_empty() {
            records = store.load_offline().await.map_err(CoreError::from)?;
            if !records.is_empty() {
                info!(count = records.len(), "booting from offline snapshot");
            }
        }
        let tree = if records.is_empty() {
            let tree = Arc::new(InodeGraph::new());
            if let Some(root) = tree.read(&tree.root_id()) {
                store.put_inode(&root).await.map_err(CoreError::from)?;
            }
            tree
        } else {
            Arc::new(InodeGraph::from_records(records))
        };

        let evictor = Arc::new(CacheEvictor::new(config.cache_max_bytes));
        for record in tree.all() {
            if let Some(size) = cache.size(&record.id) {
                evictor.seed(&record.id, size);
            }
        }

        let bus = StatusBus::new();
        let net = Arc::new(ConnectivityMonitor::new());
        let handles = Arc::new(HandleTable::new());
        let shutdown = CancellationToken::new();

        let downloads = DownloadManager::new(
            Arc::clone(&remote),
            Arc::clone(&tokens),
            Arc::clone(&tree),
            Arc::clone(&cache),
            Arc::clone(&evictor),
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&net),
        );
        let uploads = UploadManager::new(
            Arc::clone(&remote),
            Arc::clone(&tokens),
            Arc::clone(&tree),
            Arc::clone(&cache),
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&net),
            Arc::clone(&handles),
            UploadConfig::from_config(&config),
            shutdown.clone(),
        );
        let delta = DeltaApplier::new(
            Arc::clone(&remote),
            Arc::clone(&tree),
            Arc::clone(&cache),
            Arc::clone(&evictor),
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&net),
            Arc::clone(&downloads),
            Arc::clone(&uploads),
            DeltaConfig {
                drive_id: config.drive_id.clone(),
                interval_active: Duration::from_secs(config.delta_interval_active),
                interval_idle: Duration::from_secs(config.delta_interval_idle),
            },
        );

        let fs = Arc::new(Self {
            config,
            tree,
            store,
            cache,
            evictor,
            remote,
            downloads,
            uploads,
            delta,
            net,
            bus,
            handles,
            pending_remote_delete: DashSet::new(),
            shutdown,
        });

        let restored = fs.uploads.restore().await?;
        debug!(restored, "filesystem core constructed");
        Ok(fs)
    }

    /// Spawns the background machinery: upload workers, the delta loop,
    /// the connectivity probe loop, and the eviction sweep.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = self.uploads.start();

        let delta = Arc::clone(&self.delta);
        tasks.push(tokio::spawn(delta.run(self.shutdown.clone())));

        let net = Arc::clone(&self.net);
        let remote = Arc::clone(&self.remote);
        let probe_shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            net.run_probes(remote.as_ref(), probe_shutdown).await;
        }));

        let sweeper = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_SWEEP);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => break,
                    _ = ticker.tick() => sweeper.maintain_cache().await,
                }
            }
        }));

        tasks
    }

    /// Signals every worker to stop and snapshots key records for the
    /// next offline bring-up. In-flight uploads have persisted their
    /// offsets chunk by chunk already.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Err(error) = self.store.snapshot_offline(&self.tree.all()).await {
            warn!(%error, "could not write offline snapshot");
        }
        info!("filesystem core stopped");
    }

    // ------------------------------------------------------------------
    // accessors for the adapter and the IPC service
    // ------------------------------------------------------------------

    /// The status bus (the IPC service subscribes here).
    pub fn status_bus(&self) -> &StatusBus {
        &self.bus
    }

    /// The mount configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Root inode id.
    pub fn root_id(&self) -> ItemId {
        self.tree.root_id()
    }

    /// The connectivity monitor.
    pub fn network(&self) -> &Arc<ConnectivityMonitor> {
        &self.net
    }

    /// The delta applier (external notifier health feeds in here).
    pub fn delta(&self) -> &Arc<DeltaApplier> {
        &self.delta
    }

    /// Resolves a mount-relative path (IPC `GetFileStatus`).
    pub fn status_by_path(&self, path: &str) -> Result<FileStatus, CoreError> {
        let id = self.tree.resolve_path(path)?;
        self.tree
            .read(&id)
            .map(|r| r.status)
            .ok_or_else(|| CoreError::NotFound(path.to_string()))
    }

    /// Queue depths and status counts for the inspect command.
    pub async fn inspect(&self) -> Result<InspectReport, CoreError> {
        Ok(InspectReport {
            network: format!("{:?}", self.net.state()),
            inode_count: self.tree.len(),
            open_handles: self.handles.len(),
            upload_queue_depth: self.uploads.queue_depth(),
            uploads_in_flight: self.uploads.in_flight_count(),
            downloads_in_flight: self.downloads.active_count(),
            cache_used_bytes: self.evictor.used_bytes(),
            status_counts: self.store.status_counts().await.map_err(CoreError::from)?,
        })
    }

    // ------------------------------------------------------------------
    // FUSE-facing operations
    // ------------------------------------------------------------------

    /// Resolves one name within a folder, paging the listing from the
    /// remote when it has never been fetched.
    pub async fn lookup(&self, parent: &ItemId, name: &str) -> Result<Inode, CoreError> {
        let ctx = self.begin_op("lookup");
        if !self.tree.is_populated(parent) && !self.net.is_offline() {
            self.populate_children(&ctx, parent).await?;
        }
        let id = self
            .tree
            .lookup_child(parent, name)
            .ok_or_else(|| CoreError::NotFound(format!("{parent}/{name}")))?;
        self.tree
            .read(&id)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))
    }

    /// Synchronous metadata read.
    pub fn getattr(&self, id: &ItemId) -> Result<Inode, CoreError> {
        self.tree
            .read(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// Returns the folder's cached child metadata, paging it in first if
    /// the listing was never fetched. Never triggers content downloads.
    pub async fn readdir(&self, id: &ItemId) -> Result<Vec<Inode>, CoreError> {
        let ctx = self.begin_op("readdir");
        if !self.tree.is_populated(id) && !self.net.is_offline() {
            self.populate_children(&ctx, id).await?;
        }
        let children = self.tree.children_of(id)?;
        Ok(children.into_iter().filter(|c| !c.flags.deleted).collect())
    }

    /// Opens a file, downloading the body on demand. Returns the kernel
    /// handle.
    pub async fn open(&self, id: &ItemId, write: bool, truncate: bool) -> Result<u64, CoreError> {
        let _ctx = self.begin_op("open");
        let record = self.getattr(id)?;
        if record.is_dir() {
            return Err(CoreError::Invalid(format!("{id} is a directory")));
        }

        if truncate && write {
            // O_TRUNC discards the remote body without downloading it
            self.truncate(id, 0).await?;
        } else if record.status == FileStatus::Error && self.cache.exists(id) {
            // a file in Error stays readable from its previous body
        } else if !record.status.has_local_body() || !self.cache.exists(id) {
            self.downloads.fetch(id).await?;
        }

        if let Some(size) = self.cache.size(id) {
            self.evictor.touch(id, size);
        }
        self.tree.acquire_handle(id)?;
        Ok(self.handles.open(id.clone(), write))
    }

    /// Serves bytes from the cache. Open guarantees body presence.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, CoreError> {
        let handle = self
            .handles
            .get(fh)
            .ok_or_else(|| CoreError::Invalid(format!("unknown handle {fh}")))?;
        self.cache.read_at(&handle.id, offset, size)
    }

    /// Writes into the cache and dirties the inode.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, CoreError> {
        let _ctx = self.begin_op("write");
        let handle = self
            .handles
            .get(fh)
            .ok_or_else(|| CoreError::Invalid(format!("unknown handle {fh}")))?;
        if !handle.writable {
            return Err(CoreError::PermissionDenied("read-only handle".into()));
        }
        let written = self.cache.write_at(&handle.id, offset, data)?;
        handle.mark_dirty();
        let end = offset + written as u64;
        self.mark_written(&handle.id, end).await?;
        Ok(written)
    }

    /// Truncates (or extends) a file body by id (FUSE setattr).
    pub async fn truncate(&self, id: &ItemId, size: u64) -> Result<(), CoreError> {
        let _ctx = self.begin_op("truncate");
        let record = self.getattr(id)?;
        if record.is_dir() {
            return Err(CoreError::Invalid(format!("{id} is a directory")));
        }
        if !record.status.has_local_body() && size > 0 {
            // shrinking or extending a ghost needs the body first
            self.downloads.fetch(id).await?;
        } else if !self.cache.exists(id) {
            self.cache.truncate(id, 0)?;
            self.apply_transition(id, FileStatus::Downloading).await;
            self.apply_transition(id, FileStatus::Cached).await;
        }
        self.cache.truncate(id, size)?;
        self.mark_written(id, size).await?;
        // an explicit set-size is authoritative, not a high-water mark
        if let Some(slot) = self.tree.get(id) {
            let record = slot.update(|r| {
                r.size = size;
                r.clone()
            });
            self.store.put_inode(&record).await.map_err(CoreError::from)?;
        }
        Ok(())
    }

    /// Flush is called on every close of a descriptor duplicate; the real
    /// work happens at release.
    pub async fn flush(&self, _fh: u64) -> Result<(), CoreError> {
        Ok(())
    }

    /// Closes a handle. The last writable close of a dirty file queues a
    /// foreground upload; the last close of an unlinked file completes
    /// its removal.
    pub async fn release(&self, fh: u64) -> Result<(), CoreError> {
        let _ctx = self.begin_op("release");
        let (handle, remaining_writable) = self
            .handles
            .close(fh)
            .ok_or_else(|| CoreError::Invalid(format!("unknown handle {fh}")))?;
        let id = handle.id.clone();
        let remaining = self.tree.release_handle(&id);

        let record = self.tree.read(&id);
        let dirty = record.as_ref().map(|r| r.flags.has_changes).unwrap_or(false);
        let deleted = record.as_ref().map(|r| r.flags.deleted).unwrap_or(false);

        if handle.writable && dirty && !deleted && remaining_writable == 0 {
            self.uploads.enqueue(&id, UploadPriority::Foreground).await?;
        }

        if deleted && remaining == 0 {
            self.finish_removal(&id).await?;
        }
        Ok(())
    }

    /// Queues an interactive upload and waits for it (bounded). A timeout
    /// reports success; the session keeps running and failures surface on
    /// the status bus.
    pub async fn fsync(&self, fh: u64) -> Result<(), CoreError> {
        let _ctx = self.begin_op("fsync");
        let handle = self
            .handles
            .get(fh)
            .ok_or_else(|| CoreError::Invalid(format!("unknown handle {fh}")))?;
        let id = handle.id.clone();
        let record = self.getattr(&id)?;
        if !record.flags.has_changes {
            return Ok(());
        }
        self.uploads.enqueue(&id, UploadPriority::Interactive).await?;
        self.uploads
            .wait_for_completion(&id, self.config.request_timeout())
            .await
    }

    /// Creates an empty local file and opens a writable handle on it.
    pub async fn create(
        &self,
        parent: &ItemId,
        name: &str,
        mode: u32,
    ) -> Result<(Inode, u64), CoreError> {
        let ctx = self.begin_op("create");
        if !self.tree.is_populated(parent) && !self.net.is_offline() {
            self.populate_children(&ctx, parent).await?;
        }
        let inode = self
            .tree
            .create_child(parent, name, ItemKind::File, Some(mode))?;
        // the empty body must exist before the record is durable (I4)
        self.cache.truncate(&inode.id, 0)?;
        self.evictor.touch(&inode.id, 0);
        self.store.put_inode(&inode).await.map_err(CoreError::from)?;
        self.publish(&inode.id, FileStatus::LocalModified);

        self.tree.acquire_handle(&inode.id)?;
        let fh = self.handles.open(inode.id.clone(), true);
        debug!(id = %inode.id, name, "file created");
        Ok((inode, fh))
    }

    /// Creates a folder remotely, then inserts it locally.
    pub async fn mkdir(&self, parent: &ItemId, name: &str) -> Result<Inode, CoreError> {
        let ctx = self.begin_op("mkdir");
        cirrus_core::domain::name::validate_name(name)?;
        if self.net.is_offline() {
            return Err(CoreError::NotConnected);
        }
        if self.tree.lookup_child(parent, name).is_some() {
            return Err(CoreError::NameConflict(name.to_string()));
        }
        let result = self
            .with_deadline(&ctx, self.remote.create_folder(parent, name))
            .await;
        self.net.record_result(&result);
        let item = result?;
        self.tree.replace_from_remote(&item)?;
        let record = self
            .tree
            .read(&item.id)
            .ok_or_else(|| CoreError::NotFound(item.id.to_string()))?;
        self.store.put_inode(&record).await.map_err(CoreError::from)?;
        Ok(record)
    }

    /// Removes a file (or empty folder). With open handles the remote
    /// delete is deferred to the last release and happens exactly once.
    pub async fn unlink(&self, parent: &ItemId, name: &str) -> Result<(), CoreError> {
        let ctx = self.begin_op("unlink");
        let id = self
            .tree
            .lookup_child(parent, name)
            .ok_or_else(|| CoreError::NotFound(format!("{parent}/{name}")))?;
        let record = self.getattr(&id)?;
        if record.is_dir() && !self.tree.children_of(&id)?.is_empty() {
            return Err(CoreError::Invalid(format!("directory {name} not empty")));
        }

        // a queued or running upload for this inode is moot now
        self.uploads.cancel(&id).await?;

        let open_handles = self
            .tree
            .get(&id)
            .map(|slot| slot.handle_count())
            .unwrap_or(0);

        if open_handles > 0 {
            self.tree.mark_deleted(&id)?;
            if !id.is_local() {
                self.pending_remote_delete.insert(id.clone());
            }
            if let Some(record) = self.tree.read(&id) {
                self.store.put_inode(&record).await.map_err(CoreError::from)?;
            }
            debug!(id = %id, "unlink deferred to last close");
            return Ok(());
        }

        // no handles: remote first so a failure leaves the tree intact
        if !id.is_local() {
            let result = self
                .with_deadline(&ctx, self.remote.delete(&id, record.etag.as_deref()))
                .await;
            self.net.record_result(&result);
            match result {
                Ok(()) | Err(CoreError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }
        self.tree.mark_deleted(&id)?;
        self.finish_removal(&id).await
    }

    /// Renames/moves an item, enforcing the destination's unique-name
    /// invariant. The remote patch failing reverts the local change.
    pub async fn rename(
        &self,
        old_parent: &ItemId,
        old_name: &str,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<(), CoreError> {
        let ctx = self.begin_op("rename");
        let id = self
            .tree
            .lookup_child(old_parent, old_name)
            .ok_or_else(|| CoreError::NotFound(format!("{old_parent}/{old_name}")))?;
        let record = self.getattr(&id)?;
        let previous_name = record.name.clone();

        self.tree.rename(&id, new_parent, new_name)?;

        // local-only items rename purely locally; the create carries the
        // final name
        if !id.is_local() {
            let patch = ItemPatch {
                name: Some(new_name.to_string()),
                parent_id: Some(new_parent.clone()),
            };
            let result = self
                .with_deadline(&ctx, self.remote.patch(&id, &patch, record.etag.as_deref()))
                .await;
            self.net.record_result(&result);
            match result {
                Ok(item) => {
                    if let Some(slot) = self.tree.get(&id) {
                        slot.update(|r| r.etag = item.etag.clone());
                    }
                }
                Err(error) => {
                    // revert to keep local and remote views converged
                    if let Err(revert) = self.tree.rename(&id, old_parent, &previous_name) {
                        warn!(id = %id, %revert, "revert after failed rename also failed");
                    }
                    return Err(error);
                }
            }
        }
        if let Some(record) = self.tree.read(&id) {
            self.store.put_inode(&record).await.map_err(CoreError::from)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // xattr surface
    // ------------------------------------------------------------------

    /// Reads one of the exposed attributes.
    pub fn getxattr(&self, id: &ItemId, name: &str) -> Result<Vec<u8>, CoreError> {
        let record = self.getattr(id)?;
        match name {
            xattr::XATTR_STATUS => Ok(record.status.as_str().as_bytes().to_vec()),
            xattr::XATTR_HASH => Ok(record.hash.unwrap_or_default().into_bytes()),
            xattr::XATTR_PIN => Ok(if record.flags.pinned { b"1".to_vec() } else { b"0".to_vec() }),
            _ => Err(CoreError::NotFound(format!("xattr {name}"))),
        }
    }

    /// Writes one of the control attributes (pin, force refresh).
    pub async fn setxattr(&self, id: &ItemId, name: &str, value: &[u8]) -> Result<(), CoreError> {
        match name {
            xattr::XATTR_PIN => {
                let pin = value == b"1" || value.eq_ignore_ascii_case(b"true");
                self.set_pinned(id, pin).await
            }
            xattr::XATTR_REFRESH => {
                self.delta.refresh(id).await?;
                // related changes (moves, siblings) ride the next poll
                self.delta.poke();
                Ok(())
            }
            _ if xattr::is_known(name) => {
                Err(CoreError::PermissionDenied(format!("{name} is read-only")))
            }
            _ => Err(CoreError::Invalid(format!("unknown xattr {name}"))),
        }
    }

    /// Names returned by listxattr.
    pub fn listxattr(&self) -> Vec<&'static str> {
        xattr::listable().to_vec()
    }

    /// Pins or unpins a file; pinning a ghost schedules its download.
    pub async fn set_pinned(&self, id: &ItemId, pinned: bool) -> Result<(), CoreError> {
        let slot = self
            .tree
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let record = slot.update(|r| {
            r.flags.pinned = pinned;
            r.clone()
        });
        self.store.put_inode(&record).await.map_err(CoreError::from)?;
        if pinned && !self.cache.exists(id) && !record.is_dir() {
            self.downloads.request_background(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // maintenance
    // ------------------------------------------------------------------

    /// One eviction sweep: removes clean, unpinned, closed, fully-synced
    /// bodies in LRU order while over capacity. A body holding the sole
    /// copy of unsynced data is never a candidate.
    pub async fn maintain_cache(&self) {
        let plan = self.evictor.plan_eviction(|id| {
            let Some(slot) = self.tree.get(id) else {
                // untracked body: always safe to drop
                return true;
            };
            if slot.handle_count() > 0 {
                return false;
            }
            let record = slot.read();
            !record.flags.has_changes
                && !record.flags.pinned
                && !record.id.is_local()
                && !record.status.is_transferring()
        });
        for id in plan {
            debug!(id = %id, "evicting cached body");
            if let Err(error) = self.cache.delete(&id) {
                warn!(id = %id, %error, "eviction failed");
                continue;
            }
            self.evictor.forget(&id);
            self.apply_transition(&id, FileStatus::Cloud).await;
        }
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn begin_op(&self, op: &'static str) -> RequestCtx {
        let ctx = RequestCtx {
            id: Uuid::new_v4(),
            timeout: self.config.request_timeout(),
        };
        debug!(request = %ctx.id, op, "fs op");
        ctx
    }

    async fn with_deadline<T>(
        &self,
        ctx: &RequestCtx,
        fut: impl std::future::Future<Output = Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        match tokio::time::timeout(ctx.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Transient(format!(
                "request {} exceeded its deadline",
                ctx.id
            ))),
        }
    }

    /// Pages the full children listing of a folder into the tree.
    async fn populate_children(&self, ctx: &RequestCtx, parent: &ItemId) -> Result<(), CoreError> {
        let mut page_token: Option<String> = None;
        loop {
            let result = self
                .with_deadline(
                    ctx,
                    self.remote.list_children(parent, page_token.as_deref()),
                )
                .await;
            self.net.record_result(&result);
            let page = match result {
                Ok(page) => page,
                Err(error) if self.tree.is_populated(parent) => {
                    // stale listing beats no listing
                    debug!(parent = %parent, %error, "keeping stale child list");
                    return Ok(());
                }
                Err(error) => return Err(error),
            };
            for item in &page.items {
                if let Err(error) = self.tree.replace_from_remote(item) {
                    warn!(id = %item.id, %error, "could not insert listed child");
                    continue;
                }
                if let Some(record) = self.tree.read(&item.id) {
                    self.store.put_inode(&record).await.map_err(CoreError::from)?;
                }
            }
            match page.next_page {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        self.tree.set_populated(parent, true);
        Ok(())
    }

    /// Dirty-marking shared by write, truncate, and O_TRUNC opens.
    async fn mark_written(&self, id: &ItemId, end: u64) -> Result<(), CoreError> {
        let slot = self
            .tree
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let (changed, record) = slot.update(|record| {
            record.mark_dirty();
            if end > record.size {
                record.size = end;
            }
            let changed = record
                .transition_status(FileStatus::LocalModified)
                .unwrap_or(false);
            (changed, record.clone())
        });
        self.store.put_inode(&record).await.map_err(CoreError::from)?;
        if changed {
            self.publish(id, FileStatus::LocalModified);
        }
        if let Some(size) = self.cache.size(id) {
            self.evictor.touch(id, size);
        }
        Ok(())
    }

    /// Completes removal after the last reference is gone: the deferred
    /// remote delete (if this unlink originated locally), then the body
    /// and the record.
    async fn finish_removal(&self, id: &ItemId) -> Result<(), CoreError> {
        if self.pending_remote_delete.remove(id).is_some() {
            let result = self.remote.delete(id, None).await;
            self.net.record_result(&result);
            match result {
                Ok(()) | Err(CoreError::NotFound(_)) => {}
                Err(error) => {
                    warn!(id = %id, %error, "deferred remote delete failed");
                }
            }
        }
        self.cache.delete(id)?;
        self.evictor.forget(id);
        self.tree.remove_if_unused(id);
        self.store.delete_inode(id).await.map_err(CoreError::from)?;
        debug!(id = %id, "inode removed");
        Ok(())
    }

    /// Applies a status transition, persists it, and publishes the event.
    async fn apply_transition(&self, id: &ItemId, target: FileStatus) {
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
                self.publish(id, target);
            }
        }
    }

    fn publish(&self, id: &ItemId, status: FileStatus) {
        let path = self.tree.path_of(id).unwrap_or_else(|| format!("/{id}"));
        self.bus.publish(id.clone(), path, status);
    }
}

/// Bounded request context.
pub struct RequestCtx {
    /// Stable id carried through the logs of one operation
    pub id: Uuid,
    /// Deadline applied to remote-touching steps
    pub timeout: Duration,
}

/// Snapshot returned by [`Filesystem::inspect`].
#[derive(Debug, Clone)]
pub struct InspectReport {
    /// Connectivity state
    pub network: String,
    /// Inodes tracked in memory
    pub inode_count: usize,
    /// Open kernel handles
    pub open_handles: usize,
    /// Sessions queued, not yet dispatched
    pub upload_queue_depth: usize,
    /// Sessions owned by workers right now
    pub uploads_in_flight: usize,
    /// Downloads in flight
    pub downloads_in_flight: usize,
    /// Bytes tracked by the eviction index
    pub cache_used_bytes: u64,
    /// Inode counts per file status
    pub status_counts: Vec<(String, i64)>,
}
