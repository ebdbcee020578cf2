//! CirrusFS content cache
//!
//! A directory of file bodies keyed by item id, stored in a hash-based
//! fan-out layout. Downloads are staged in `tmp/` and atomically renamed
//! into `content/` after hash verification; eviction removes clean,
//! unpinned, closed entries in LRU order when the configured capacity is
//! exceeded. A body that is the sole copy of unsynced data is never
//! evicted.

pub mod content;
pub mod eviction;

pub use content::{ContentCache, StagedDownload};
pub use eviction::CacheEvictor;
