//! Kernel file-handle table.
//!
//! Handles are kernel-visible integers bound to an inode id and the open
//! flags. The table additionally tracks, per inode, how many writable
//! handles remain open: the close of the *last* writable handle is what
//! triggers the foreground upload.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use cirrus_core::domain::ItemId;
use dashmap::DashMap;

/// One open file handle.
pub struct OpenHandle {
    /// Inode the handle is bound to
    pub id: ItemId,
    /// True if opened with a writable flag (O_WRONLY/O_RDWR)
    pub writable: bool,
    /// Set by the first write through this handle
    dirty: AtomicBool,
}

impl OpenHandle {
    /// Marks the handle dirty after a write.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// True if any write went through this handle.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}

/// Allocates and tracks open handles.
pub struct HandleTable {
    next: AtomicU64,
    handles: DashMap<u64, Arc<OpenHandle>>,
    writable_counts: DashMap<ItemId, u32>,
}

impl HandleTable {
    /// Creates an empty table. Handle numbers start at 1; 0 is never
    /// handed out.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            handles: DashMap::new(),
            writable_counts: DashMap::new(),
        }
    }

    /// Allocates a handle for an inode.
    pub fn open(&self, id: ItemId, writable: bool) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        if writable {
            *self.writable_counts.entry(id.clone()).or_insert(0) += 1;
        }
        self.handles.insert(
            fh,
            Arc::new(OpenHandle {
                id,
                writable,
                dirty: AtomicBool::new(false),
            }),
        );
        fh
    }

    /// Looks up an open handle.
    pub fn get(&self, fh: u64) -> Option<Arc<OpenHandle>> {
        self.handles.get(&fh).map(|h| Arc::clone(&h))
    }

    /// Closes a handle. Returns the handle and the number of writable
    /// handles still open for its inode.
    pub fn close(&self, fh: u64) -> Option<(Arc<OpenHandle>, u32)> {
        let (_, handle) = self.handles.remove(&fh)?;
        let remaining_writable = if handle.writable {
            match self.writable_counts.get_mut(&handle.id) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    drop(count);
                    if remaining == 0 {
                        self.writable_counts.remove(&handle.id);
                    }
                    remaining
                }
                None => 0,
            }
        } else {
            self.writable_counts
                .get(&handle.id)
                .map(|c| *c)
                .unwrap_or(0)
        };
        Some((handle, remaining_writable))
    }

    /// Number of writable handles open for an inode.
    pub fn writable_count(&self, id: &ItemId) -> u32 {
        self.writable_counts.get(id).map(|c| *c).unwrap_or(0)
    }

    /// Total open handles (diagnostics).
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True if nothing is open.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Rebinds every handle of `old` to `new` (id remap after a create
    /// upload completes while the file is still open).
    pub fn remap_id(&self, old: &ItemId, new: &ItemId) {
        let remapped: Vec<(u64, Arc<OpenHandle>)> = self
            .handles
            .iter()
            .filter(|e| &e.value().id == old)
            .map(|e| {
                let h = e.value();
                (
                    *e.key(),
                    Arc::new(OpenHandle {
                        id: new.clone(),
                        writable: h.writable,
                        dirty: AtomicBool::new(h.is_dirty()),
                    }),
                )
            })
            .collect();
        for (fh, handle) in remapped {
            self.handles.insert(fh, handle);
        }
        if let Some((_, count)) = self.writable_counts.remove(old) {
            self.writable_counts.insert(new.clone(), count);
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close_roundtrip() {
        let table = HandleTable::new();
        let fh = table.open(ItemId::new("A"), false);
        assert!(fh > 0);
        assert_eq!(table.get(fh).unwrap().id.as_str(), "A");

        let (handle, remaining) = table.close(fh).unwrap();
        assert!(!handle.writable);
        assert_eq!(remaining, 0);
        assert!(table.get(fh).is_none());
    }

    #[test]
    fn test_last_writable_close_detection() {
        let table = HandleTable::new();
        let id = ItemId::new("W");
        let w1 = table.open(id.clone(), true);
        let w2 = table.open(id.clone(), true);
        let r1 = table.open(id.clone(), false);
        assert_eq!(table.writable_count(&id), 2);

        let (_, remaining) = table.close(w1).unwrap();
        assert_eq!(remaining, 1);

        // a read-only close never reports zero writable as its doing
        let (handle, remaining) = table.close(r1).unwrap();
        assert!(!handle.writable);
        assert_eq!(remaining, 1);

        let (_, remaining) = table.close(w2).unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(table.writable_count(&id), 0);
    }

    #[test]
    fn test_dirty_tracking() {
        let table = HandleTable::new();
        let fh = table.open(ItemId::new("D"), true);
        assert!(!table.get(fh).unwrap().is_dirty());

        table.get(fh).unwrap().mark_dirty();
        let (handle, _) = table.close(fh).unwrap();
        assert!(handle.is_dirty());
    }

    #[test]
    fn test_remap_id_preserves_handles() {
        let table = HandleTable::new();
        let local = ItemId::new_local();
        let fh = table.open(local.clone(), true);
        table.get(fh).unwrap().mark_dirty();

        let server = ItemId::new("SRV");
        table.remap_id(&local, &server);

        let handle = table.get(fh).unwrap();
        assert_eq!(handle.id, server);
        assert!(handle.is_dirty());
        assert_eq!(table.writable_count(&server), 1);
        assert_eq!(table.writable_count(&local), 0);
    }

    #[test]
    fn test_handle_numbers_are_unique() {
        let table = HandleTable::new();
        let a = table.open(ItemId::new("X"), false);
        let b = table.open(ItemId::new("X"), false);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }
}
