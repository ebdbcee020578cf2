//! In-memory inode graph.
//!
//! Two indices: id → inode and parent-id → ordered child set. Child order
//! is insertion order; name uniqueness within a folder is case-insensitive
//! via [`fold_name`]. The id→inode index holds the only strong references;
//! parent/child indices store ids, never `Arc`s, so the graph stays a tree.
//!
//! An inode with open handles survives delete-from-parent logically: it is
//! detached from its parent's child set but remains in the id index until
//! the last handle closes (POSIX unlink semantics).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use cirrus_core::domain::name::{fold_name, validate_name};
use cirrus_core::domain::{
    item::{DIR_MODE, FILE_MODE},
    CoreError, FileStatus, Inode, ItemId, ItemKind,
};
use cirrus_core::ports::RemoteItem;
use dashmap::DashMap;

/// One inode plus its open-handle count.
pub struct InodeSlot {
    record: RwLock<Inode>,
    handles: AtomicU32,
}

impl InodeSlot {
    fn new(inode: Inode) -> Self {
        Self {
            record: RwLock::new(inode),
            handles: AtomicU32::new(0),
        }
    }

    /// Snapshot of the record.
    pub fn read(&self) -> Inode {
        self.record.read().unwrap().clone()
    }

    /// Runs `f` with the record locked for writing.
    pub fn update<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        let mut guard = self.record.write().unwrap();
        f(&mut guard)
    }

    /// Number of open FUSE handles.
    pub fn handle_count(&self) -> u32 {
        self.handles.load(Ordering::SeqCst)
    }
}

/// Ordered, case-insensitively unique child list of one folder.
#[derive(Default)]
struct ChildSet {
    order: Vec<ItemId>,
    by_key: HashMap<String, ItemId>,
    /// False until the folder's listing has been paged from the remote
    populated: bool,
}

impl ChildSet {
    fn insert(&mut self, key: String, id: ItemId) -> Result<(), CoreError> {
        if let Some(existing) = self.by_key.get(&key) {
            if *existing != id {
                return Err(CoreError::NameConflict(key));
            }
            return Ok(());
        }
        self.by_key.insert(key, id.clone());
        self.order.push(id);
        Ok(())
    }

    fn remove(&mut self, key: &str, id: &ItemId) {
        self.by_key.remove(key);
        self.order.retain(|c| c != id);
    }

    /// Re-keys an existing child in place (same-folder rename); order is
    /// preserved.
    fn rename_key(&mut self, old_key: &str, new_key: String, id: &ItemId) -> Result<(), CoreError> {
        if let Some(existing) = self.by_key.get(&new_key) {
            if existing != id {
                return Err(CoreError::NameConflict(new_key));
            }
        }
        self.by_key.remove(old_key);
        self.by_key.insert(new_key, id.clone());
        Ok(())
    }
}

/// What [`InodeGraph::replace_from_remote`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// A new inode was inserted
    Created,
    /// An existing inode was updated; true if the content hash changed
    Updated {
        /// The remote body differs from what the metadata recorded
        content_changed: bool,
    },
    /// The item matched the local record exactly (idempotent re-apply)
    Unchanged,
}

/// The mount's inode tree.
pub struct InodeGraph {
    nodes: DashMap<ItemId, Arc<InodeSlot>>,
    children: DashMap<ItemId, RwLock<ChildSet>>,
    root: RwLock<ItemId>,
}

impl InodeGraph {
    /// Creates a graph containing only the root inode under its well-known
    /// id.
    pub fn new() -> Self {
        let graph = Self {
            nodes: DashMap::new(),
            children: DashMap::new(),
            root: RwLock::new(ItemId::root()),
        };
        let root = Inode::new_root();
        graph.children.insert(root.id.clone(), RwLock::default());
        graph.nodes.insert(root.id.clone(), Arc::new(InodeSlot::new(root)));
        graph
    }

    /// Rebuilds a graph from persisted records (startup / offline
    /// bring-up). Records whose parent is missing are skipped with a
    /// warning; the next delta poll restores them.
    pub fn from_records(records: Vec<Inode>) -> Self {
        let graph = Self::new();
        // insert folders first so parents exist for attachment
        let mut pending: Vec<Inode> = records;
        pending.sort_by_key(|r| !r.is_dir());

        // the persisted root replaces the placeholder
        if let Some(pos) = pending.iter().position(|r| r.parent.is_none()) {
            let stored_root = pending.remove(pos);
            let old_root = graph.root_id();
            if stored_root.id != old_root {
                graph.nodes.remove(&old_root);
                graph.children.remove(&old_root);
                graph
                    .children
                    .insert(stored_root.id.clone(), RwLock::default());
                *graph.root.write().unwrap() = stored_root.id.clone();
            }
            graph
                .nodes
                .insert(stored_root.id.clone(), Arc::new(InodeSlot::new(stored_root)));
        }

        let mut deferred = pending;
        let mut made_progress = true;
        while made_progress && !deferred.is_empty() {
            made_progress = false;
            deferred.retain(|record| {
                let parent_known = record
                    .parent
                    .as_ref()
                    .is_some_and(|p| graph.nodes.contains_key(p));
                if parent_known {
                    if let Err(err) = graph.insert(record.clone()) {
                        tracing::warn!(id = %record.id, error = %err, "skipping stored inode");
                    }
                    made_progress = true;
                    false
                } else {
                    true
                }
            });
        }
        for orphan in &deferred {
            tracing::warn!(id = %orphan.id, "stored inode has no parent, dropping");
        }
        graph
    }

    /// Current root id.
    pub fn root_id(&self) -> ItemId {
        self.root.read().unwrap().clone()
    }

    /// Looks up a slot by id.
    pub fn get(&self, id: &ItemId) -> Option<Arc<InodeSlot>> {
        self.nodes.get(id).map(|r| Arc::clone(&r))
    }

    /// Snapshot of a record by id.
    pub fn read(&self, id: &ItemId) -> Option<Inode> {
        self.get(id).map(|slot| slot.read())
    }

    /// True if the id is present.
    pub fn contains(&self, id: &ItemId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of inodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if only the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Snapshot of every record (persistence scans).
    pub fn all(&self) -> Vec<Inode> {
        self.nodes.iter().map(|e| e.value().read()).collect()
    }

    // ------------------------------------------------------------------
    // structure mutations
    // ------------------------------------------------------------------

    /// Inserts a fully-formed record and attaches it to its parent.
    ///
    /// # Errors
    ///
    /// `NotFound` if the parent is unknown, `NotADirectory` if it is not a
    /// folder, `NameConflict` on a case-insensitive sibling collision.
    pub fn insert(&self, inode: Inode) -> Result<(), CoreError> {
        let parent_id = inode
            .parent
            .clone()
            .ok_or_else(|| CoreError::Invalid("non-root inode requires a parent".into()))?;

        let parent = self
            .get(&parent_id)
            .ok_or_else(|| CoreError::NotFound(format!("parent {parent_id}")))?;
        if !parent.read().is_dir() {
            return Err(CoreError::NotADirectory(parent_id.to_string()));
        }

        let key = fold_name(&inode.name);
        let set = self
            .children
            .entry(parent_id)
            .or_insert_with(RwLock::default);
        set.write().unwrap().insert(key, inode.id.clone())?;
        drop(set);

        if inode.is_dir() {
            self.children
                .entry(inode.id.clone())
                .or_insert_with(RwLock::default);
        }
        self.nodes
            .insert(inode.id.clone(), Arc::new(InodeSlot::new(inode)));
        Ok(())
    }

    /// Creates a locally-originated child with a fresh local-only id.
    pub fn create_child(
        &self,
        parent: &ItemId,
        name: &str,
        kind: ItemKind,
        mode: Option<u32>,
    ) -> Result<Inode, CoreError> {
        validate_name(name)?;
        let inode = match kind {
            ItemKind::Folder => Inode::new_local_folder(name, parent.clone()),
            _ => Inode::new_local_file(name, parent.clone(), mode.unwrap_or(FILE_MODE)),
        };
        self.insert(inode.clone())?;
        Ok(inode)
    }

    /// Case-insensitive child lookup.
    pub fn lookup_child(&self, parent: &ItemId, name: &str) -> Option<ItemId> {
        let set = self.children.get(parent)?;
        let id = set.read().unwrap().by_key.get(&fold_name(name)).cloned();
        id
    }

    /// Children of a folder in insertion order.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `NotADirectory` for non-folders.
    pub fn children_of(&self, parent: &ItemId) -> Result<Vec<Inode>, CoreError> {
        let slot = self
            .get(parent)
            .ok_or_else(|| CoreError::NotFound(parent.to_string()))?;
        if !slot.read().is_dir() {
            return Err(CoreError::NotADirectory(parent.to_string()));
        }
        let ids: Vec<ItemId> = match self.children.get(parent) {
            Some(set) => set.read().unwrap().order.clone(),
            None => Vec::new(),
        };
        Ok(ids.iter().filter_map(|id| self.read(id)).collect())
    }

    /// True once the folder's listing has been fetched at least once.
    pub fn is_populated(&self, parent: &ItemId) -> bool {
        self.children
            .get(parent)
            .map(|set| set.read().unwrap().populated)
            .unwrap_or(false)
    }

    /// Marks a folder's listing as fetched (or invalidates it again).
    pub fn set_populated(&self, parent: &ItemId, populated: bool) {
        if let Some(set) = self.children.get(parent) {
            set.write().unwrap().populated = populated;
        }
    }

    /// Renames and/or moves an inode, enforcing destination uniqueness.
    pub fn rename(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<(), CoreError> {
        validate_name(new_name)?;
        let slot = self
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let (old_parent, old_name) = {
            let record = slot.read();
            (record.parent.clone(), record.name.clone())
        };
        let old_parent =
            old_parent.ok_or_else(|| CoreError::Invalid("cannot rename the root".into()))?;

        let target = self
            .get(new_parent)
            .ok_or_else(|| CoreError::NotFound(new_parent.to_string()))?;
        if !target.read().is_dir() {
            return Err(CoreError::NotADirectory(new_parent.to_string()));
        }

        let new_key = fold_name(new_name);
        let old_key = fold_name(&old_name);
        if old_parent == *new_parent {
            let set = self
                .children
                .entry(new_parent.clone())
                .or_insert_with(RwLock::default);
            set.write().unwrap().rename_key(&old_key, new_key, id)?;
        } else {
            // destination first: a collision must not detach the source
            {
                let set = self
                    .children
                    .entry(new_parent.clone())
                    .or_insert_with(RwLock::default);
                set.write().unwrap().insert(new_key, id.clone())?;
            }
            if let Some(set) = self.children.get(&old_parent) {
                set.write().unwrap().remove(&old_key, id);
            }
        }

        slot.update(|record| {
            record.parent = Some(new_parent.clone());
            record.name = new_name.to_string();
            record.modified = chrono::Utc::now();
        });
        Ok(())
    }

    /// Tombstones an inode and detaches it from its parent's listing.
    /// The record stays in the id index while handles remain open.
    pub fn mark_deleted(&self, id: &ItemId) -> Result<(), CoreError> {
        let slot = self
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let (parent, name) = slot.update(|record| {
            record.flags.deleted = true;
            (record.parent.clone(), record.name.clone())
        });
        if let Some(parent) = parent {
            if let Some(set) = self.children.get(&parent) {
                set.write().unwrap().remove(&fold_name(&name), id);
            }
        }
        Ok(())
    }

    /// Drops a tombstoned inode from the id index once nothing references
    /// it. Returns true if it was removed.
    pub fn remove_if_unused(&self, id: &ItemId) -> bool {
        let Some(slot) = self.get(id) else {
            return false;
        };
        if slot.handle_count() > 0 || !slot.read().flags.deleted {
            return false;
        }
        self.nodes.remove(id);
        self.children.remove(id);
        true
    }

    /// Rebinds an inode to its server-assigned id after the first upload.
    /// Parent listings, child parent pointers, and the id index all move.
    pub fn remap_id(&self, old: &ItemId, new: &ItemId) -> Result<(), CoreError> {
        let (_, slot) = self
            .nodes
            .remove(old)
            .ok_or_else(|| CoreError::NotFound(old.to_string()))?;

        let (parent, name) = slot.update(|record| {
            record.id = new.clone();
            (record.parent.clone(), record.name.clone())
        });

        if let Some(parent) = parent {
            if let Some(set) = self.children.get(&parent) {
                let mut set = set.write().unwrap();
                let key = fold_name(&name);
                set.by_key.insert(key, new.clone());
                for slot_id in set.order.iter_mut() {
                    if slot_id == old {
                        *slot_id = new.clone();
                    }
                }
            }
        }

        if let Some((_, child_set)) = self.children.remove(old) {
            for child_id in &child_set.read().unwrap().order {
                if let Some(child) = self.get(child_id) {
                    child.update(|record| record.parent = Some(new.clone()));
                }
            }
            self.children.insert(new.clone(), child_set);
        }

        self.nodes.insert(new.clone(), slot);
        Ok(())
    }

    // ------------------------------------------------------------------
    // remote reconciliation
    // ------------------------------------------------------------------

    /// Reconciles one remote item into the graph: the convergence
    /// operation used by the delta applier.
    ///
    /// The caller has already decided policy (tombstones, dirty-local
    /// protection); this applies metadata mechanically, moving/renaming
    /// under the unique-name constraint when the parent or name changed.
    pub fn replace_from_remote(&self, item: &RemoteItem) -> Result<ReplaceOutcome, CoreError> {
        // the drive root arrives with no parent: adopt its server id
        let Some(remote_parent) = item.parent_id.clone() else {
            let root_id = self.root_id();
            if root_id != item.id {
                self.remap_id(&root_id, &item.id)?;
                *self.root.write().unwrap() = item.id.clone();
            }
            if let Some(slot) = self.get(&item.id) {
                slot.update(|record| record.etag = item.etag.clone());
            }
            return Ok(ReplaceOutcome::Updated {
                content_changed: false,
            });
        };

        match self.get(&item.id) {
            None => {
                let parent = remote_parent;
                let now = chrono::Utc::now();
                let inode = Inode {
                    id: item.id.clone(),
                    name: item.name.clone(),
                    parent: Some(parent),
                    kind: item.kind,
                    size: item.size,
                    mode: if item.kind.is_dir() { DIR_MODE } else { FILE_MODE },
                    created: item.created.unwrap_or(now),
                    modified: item.modified.unwrap_or(now),
                    etag: item.etag.clone(),
                    hash: item.hash.clone(),
                    mime: item.mime.clone(),
                    flags: Default::default(),
                    status: if item.kind.is_dir() {
                        FileStatus::Cached
                    } else {
                        FileStatus::Cloud
                    },
                    last_error: None,
                };
                self.insert(inode)?;
                Ok(ReplaceOutcome::Created)
            }
            Some(slot) => {
                let current = slot.read();
                if current.etag.is_some() && current.etag == item.etag {
                    // idempotent re-application of an already-seen change
                    return Ok(ReplaceOutcome::Unchanged);
                }

                let moved = current.parent.as_ref() != Some(&remote_parent)
                    || current.name != item.name;
                if moved {
                    self.rename(&item.id, &remote_parent, &item.name)?;
                }

                let content_changed = !item.kind.is_dir()
                    && item.hash.is_some()
                    && current.hash != item.hash;

                slot.update(|record| {
                    record.size = item.size;
                    record.etag = item.etag.clone();
                    record.hash = item.hash.clone();
                    record.mime = item.mime.clone();
                    if let Some(modified) = item.modified {
                        record.modified = modified;
                    }
                });
                Ok(ReplaceOutcome::Updated { content_changed })
            }
        }
    }

    // ------------------------------------------------------------------
    // path resolution
    // ------------------------------------------------------------------

    /// Resolves a mount-relative path (`/a/b/c`) to an id, case-folding
    /// each segment.
    pub fn resolve_path(&self, path: &str) -> Result<ItemId, CoreError> {
        let mut current = self.root_id();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let slot = self
                .get(&current)
                .ok_or_else(|| CoreError::NotFound(path.to_string()))?;
            if !slot.read().is_dir() {
                return Err(CoreError::NotADirectory(path.to_string()));
            }
            current = self
                .lookup_child(&current, segment)
                .ok_or_else(|| CoreError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Builds the mount-relative path of an inode (for status events).
    pub fn path_of(&self, id: &ItemId) -> Option<String> {
        let mut segments = Vec::new();
        let mut current = id.clone();
        loop {
            let record = self.read(&current)?;
            match record.parent {
                None => break,
                Some(parent) => {
                    segments.push(record.name);
                    current = parent;
                }
            }
        }
        segments.reverse();
        Some(format!("/{}", segments.join("/")))
    }

    // ------------------------------------------------------------------
    // handle accounting
    // ------------------------------------------------------------------

    /// Increments the open-handle count.
    pub fn acquire_handle(&self, id: &ItemId) -> Result<u32, CoreError> {
        let slot = self
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        Ok(slot.handles.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Decrements the open-handle count; returns the remaining count.
    pub fn release_handle(&self, id: &ItemId) -> u32 {
        match self.get(id) {
            Some(slot) => {
                let previous = slot.handles.fetch_sub(1, Ordering::SeqCst);
                previous.saturating_sub(1)
            }
            None => 0,
        }
    }
}

impl Default for InodeGraph {
    fn default() -> Self {
        Self::new()
    }
}
