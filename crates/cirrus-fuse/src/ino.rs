//! Kernel inode-number allocation.
//!
//! FUSE speaks u64 inode numbers; the core speaks opaque item ids. This
//! table hands out stable numbers per id for the lifetime of the mount.
//! When an upload remaps a local-only id to its server id the old number
//! goes stale; the kernel re-looks the path up and receives a fresh one.

use std::sync::atomic::{AtomicU64, Ordering};

use cirrus_core::domain::ItemId;
use dashmap::DashMap;

/// The root inode number FUSE expects.
pub const ROOT_INO: u64 = 1;

/// Bidirectional ino ↔ item-id table.
pub struct InoMap {
    by_ino: DashMap<u64, ItemId>,
    by_id: DashMap<ItemId, u64>,
    next: AtomicU64,
}

impl InoMap {
    /// Creates a table with the root pre-bound to ino 1.
    pub fn new(root: ItemId) -> Self {
        let map = Self {
            by_ino: DashMap::new(),
            by_id: DashMap::new(),
            next: AtomicU64::new(2),
        };
        map.by_ino.insert(ROOT_INO, root.clone());
        map.by_id.insert(root, ROOT_INO);
        map
    }

    /// Returns the ino for an id, allocating one on first sight.
    pub fn assign(&self, id: &ItemId) -> u64 {
        if let Some(ino) = self.by_id.get(id) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        self.by_id.insert(id.clone(), ino);
        self.by_ino.insert(ino, id.clone());
        ino
    }

    /// Resolves an ino back to its id.
    pub fn resolve(&self, ino: u64) -> Option<ItemId> {
        self.by_ino.get(&ino).map(|id| id.clone())
    }

    /// Drops a mapping (forgotten by the kernel or removed).
    pub fn forget(&self, ino: u64) {
        if let Some((_, id)) = self.by_ino.remove(&ino) {
            self.by_id.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_ino_one() {
        let map = InoMap::new(ItemId::root());
        assert_eq!(map.resolve(ROOT_INO).unwrap(), ItemId::root());
        assert_eq!(map.assign(&ItemId::root()), ROOT_INO);
    }

    #[test]
    fn test_assign_is_stable() {
        let map = InoMap::new(ItemId::root());
        let id = ItemId::new("A");
        let ino = map.assign(&id);
        assert!(ino >= 2);
        assert_eq!(map.assign(&id), ino);
        assert_eq!(map.resolve(ino).unwrap(), id);
    }

    #[test]
    fn test_forget_releases_both_directions() {
        let map = InoMap::new(ItemId::root());
        let id = ItemId::new("B");
        let ino = map.assign(&id);

        map.forget(ino);
        assert!(map.resolve(ino).is_none());
        // a fresh assignment gets a new number
        assert_ne!(map.assign(&id), ino);
    }
}
