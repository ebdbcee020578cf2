//! LRU eviction over cached bodies.
//!
//! The evictor tracks recency and size per cached id and plans deletions
//! when usage exceeds the configured capacity. Whether an entry may be
//! evicted is the caller's call: the filesystem passes a predicate that
//! rejects dirty, pinned, local-only, and currently-open entries, so a
//! body that is the sole copy of unsynced data is never removed.

use std::sync::Mutex;

use cirrus_core::domain::ItemId;
use lru::LruCache;

/// Recency/size bookkeeping and eviction planning.
pub struct CacheEvictor {
    capacity: u64,
    state: Mutex<EvictorState>,
}

struct EvictorState {
    lru: LruCache<ItemId, u64>,
    used: u64,
}

impl CacheEvictor {
    /// Creates an evictor for a cache of `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(EvictorState {
                lru: LruCache::unbounded(),
                used: 0,
            }),
        }
    }

    /// Records an access to (or resize of) a cached body.
    pub fn touch(&self, id: &ItemId, size: u64) {
        let mut state = self.state.lock().unwrap();
        let old = state.lru.put(id.clone(), size).unwrap_or(0);
        state.used = state.used - old + size;
    }

    /// Seeds an entry at startup without promoting it.
    pub fn seed(&self, id: &ItemId, size: u64) {
        self.touch(id, size);
    }

    /// Drops an entry after its body was deleted.
    pub fn forget(&self, id: &ItemId) {
        let mut state = self.state.lock().unwrap();
        if let Some(size) = state.lru.pop(id) {
            state.used -= size;
        }
    }

    /// Total bytes currently tracked.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().unwrap().used
    }

    /// True if tracked usage exceeds the capacity.
    pub fn over_capacity(&self) -> bool {
        self.used_bytes() > self.capacity
    }

    /// Tracked ids, most recently used first.
    pub fn tracked_ids(&self) -> Vec<ItemId> {
        let state = self.state.lock().unwrap();
        state.lru.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Plans which entries to delete, least recently used first, until the
    /// cache would fit the capacity again. Entries rejected by
    /// `is_evictable` are skipped and kept. The caller deletes the bodies
    /// and then calls [`CacheEvictor::forget`] per id.
    pub fn plan_eviction<F>(&self, is_evictable: F) -> Vec<ItemId>
    where
        F: Fn(&ItemId) -> bool,
    {
        let state = self.state.lock().unwrap();
        if state.used <= self.capacity {
            return Vec::new();
        }

        let mut excess = state.used - self.capacity;
        let entries: Vec<(ItemId, u64)> = state
            .lru
            .iter()
            .map(|(id, size)| (id.clone(), *size))
            .collect();

        let mut plan = Vec::new();
        // iter() yields most-recent first; walk backwards for LRU order
        for (id, size) in entries.into_iter().rev() {
            if excess == 0 {
                break;
            }
            if !is_evictable(&id) {
                continue;
            }
            excess = excess.saturating_sub(size);
            plan.push(id);
        }

        if excess > 0 {
            tracing::warn!(
                short_bytes = excess,
                "cache over capacity but no further evictable entries"
            );
        }
        plan
    }
}
