//! CirrusFS metadata store
//!
//! A single embedded SQLite database holding the durable state of one
//! mount: inode records, the upload journal, cached delta cursors,
//! thumbnails, and the offline bring-up snapshot. All writes are
//! single-table puts/deletes serialized as JSON; cross-table atomicity is
//! not required because every mutation is idempotent, so a torn restart is
//! repaired by replaying the upload journal or refreshing the delta cursor.

pub mod error;
pub mod pool;
pub mod store;

pub use error::StoreError;
pub use pool::DatabasePool;
pub use store::{MetadataStore, StoreBatch};
