//! The metadata store proper
//!
//! Typed accessors over the five key/value tables. Records cross the SQL
//! boundary as JSON text; ids are the primary keys. Reads never hold a
//! transaction, so they block writers for at most a single record fetch.

use cirrus_core::domain::{Inode, ItemId, UploadSession};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::pool::DatabasePool;

/// Durable store for one mount's metadata
///
/// The store is the sole durability authority: no in-memory state is
/// considered durable until written here.
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Wraps an opened database pool.
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    // ------------------------------------------------------------------
    // inodes
    // ------------------------------------------------------------------

    /// Inserts or replaces one inode record.
    pub async fn put_inode(&self, inode: &Inode) -> Result<(), StoreError> {
        let record = serde_json::to_string(inode)?;
        sqlx::query("INSERT OR REPLACE INTO inodes (id, record) VALUES (?1, ?2)")
            .bind(inode.id.as_str())
            .bind(record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetches one inode record.
    pub async fn get_inode(&self, id: &ItemId) -> Result<Option<Inode>, StoreError> {
        let row = sqlx::query("SELECT record FROM inodes WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let record: String = row.try_get("record")?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    /// Deletes one inode record. Deleting an absent id is a no-op.
    pub async fn delete_inode(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inodes WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads every persisted inode record (startup scan).
    pub async fn all_inodes(&self) -> Result<Vec<Inode>, StoreError> {
        let rows = sqlx::query("SELECT record FROM inodes")
            .fetch_all(&self.pool)
            .await?;
        let mut inodes = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.try_get("record")?;
            inodes.push(serde_json::from_str(&record)?);
        }
        Ok(inodes)
    }

    /// Counts inodes grouped by file status (for the inspect command).
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT json_extract(record, '$.status') AS status, COUNT(*) AS n \
             FROM inodes GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.push((status, n));
        }
        Ok(counts)
    }

    // ------------------------------------------------------------------
    // uploads
    // ------------------------------------------------------------------

    /// Inserts or replaces one upload session, keyed by its inode id.
    pub async fn put_upload(&self, session: &UploadSession) -> Result<(), StoreError> {
        let record = serde_json::to_string(session)?;
        sqlx::query("INSERT OR REPLACE INTO uploads (id, record) VALUES (?1, ?2)")
            .bind(session.item_id.as_str())
            .bind(record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetches the session for one inode.
    pub async fn get_upload(&self, id: &ItemId) -> Result<Option<UploadSession>, StoreError> {
        let row = sqlx::query("SELECT record FROM uploads WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let record: String = row.try_get("record")?;
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    /// Deletes one session record.
    pub async fn delete_upload(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM uploads WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads every persisted upload session (recovery scan).
    pub async fn all_uploads(&self) -> Result<Vec<UploadSession>, StoreError> {
        let rows = sqlx::query("SELECT record FROM uploads")
            .fetch_all(&self.pool)
            .await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.try_get("record")?;
            sessions.push(serde_json::from_str(&record)?);
        }
        Ok(sessions)
    }

    /// Number of persisted upload sessions (for the inspect command).
    pub async fn upload_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM uploads")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // ------------------------------------------------------------------
    // deltas
    // ------------------------------------------------------------------

    /// Persists the delta cursor for one drive. This single-record write is
    /// the commit point of a delta page.
    pub async fn put_delta_cursor(&self, drive_id: &str, cursor: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO deltas (drive_id, cursor) VALUES (?1, ?2)")
            .bind(drive_id)
            .bind(cursor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetches the persisted cursor for one drive.
    pub async fn get_delta_cursor(&self, drive_id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT cursor FROM deltas WHERE drive_id = ?1")
            .bind(drive_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("cursor")?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // thumbnails
    // ------------------------------------------------------------------

    /// Stores a small thumbnail image for an item.
    pub async fn put_thumbnail(&self, id: &ItemId, image: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO thumbnails (id, image) VALUES (?1, ?2)")
            .bind(id.as_str())
            .bind(image)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetches a stored thumbnail.
    pub async fn get_thumbnail(&self, id: &ItemId) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT image FROM thumbnails WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("image")?)),
            None => Ok(None),
        }
    }

    /// Deletes a stored thumbnail.
    pub async fn delete_thumbnail(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM thumbnails WHERE id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // offline snapshot
    // ------------------------------------------------------------------

    /// Replaces the offline bring-up snapshot with the given records.
    pub async fn snapshot_offline(&self, inodes: &[Inode]) -> Result<(), StoreError> {
        let mut batch = self.begin().await?;
        sqlx::query("DELETE FROM offline")
            .execute(&mut *batch.tx)
            .await?;
        for inode in inodes {
            let record = serde_json::to_string(inode)?;
            sqlx::query("INSERT INTO offline (id, record) VALUES (?1, ?2)")
                .bind(inode.id.as_str())
                .bind(record)
                .execute(&mut *batch.tx)
                .await?;
        }
        batch.commit().await
    }

    /// Loads the offline bring-up snapshot.
    pub async fn load_offline(&self) -> Result<Vec<Inode>, StoreError> {
        let rows = sqlx::query("SELECT record FROM offline")
            .fetch_all(&self.pool)
            .await?;
        let mut inodes = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.try_get("record")?;
            inodes.push(serde_json::from_str(&record)?);
        }
        Ok(inodes)
    }

    // ------------------------------------------------------------------
    // batches
    // ------------------------------------------------------------------

    /// Opens a write batch with guaranteed commit or rollback. Dropping the
    /// batch without committing rolls it back.
    pub async fn begin(&self) -> Result<StoreBatch<'_>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(StoreBatch { tx })
    }
}

/// A scoped write batch
///
/// Mutations applied through the batch become visible atomically at
/// [`StoreBatch::commit`]; dropping the batch discards them.
pub struct StoreBatch<'a> {
    tx: sqlx::Transaction<'a, sqlx::Sqlite>,
}

impl StoreBatch<'_> {
    /// Inserts or replaces an inode record within the batch.
    pub async fn put_inode(&mut self, inode: &Inode) -> Result<(), StoreError> {
        let record = serde_json::to_string(inode)?;
        sqlx::query("INSERT OR REPLACE INTO inodes (id, record) VALUES (?1, ?2)")
            .bind(inode.id.as_str())
            .bind(record)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Deletes an inode record within the batch.
    pub async fn delete_inode(&mut self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inodes WHERE id = ?1")
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Inserts or replaces an upload session within the batch.
    pub async fn put_upload(&mut self, session: &UploadSession) -> Result<(), StoreError> {
        let record = serde_json::to_string(session)?;
        sqlx::query("INSERT OR REPLACE INTO uploads (id, record) VALUES (?1, ?2)")
            .bind(session.item_id.as_str())
            .bind(record)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Deletes an upload session within the batch.
    pub async fn delete_upload(&mut self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM uploads WHERE id = ?1")
            .bind(id.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Commits the batch.
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Explicitly rolls the batch back (dropping it does the same).
    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cirrus_core::domain::{
        item::FILE_MODE, FileStatus, UploadPriority, UploadState,
    };

    use super::*;

    async fn open_store() -> MetadataStore {
        let pool = DatabasePool::in_memory().await.unwrap();
        MetadataStore::new(&pool)
    }

    fn sample_inode(id: &str) -> Inode {
        let mut inode = Inode::new_local_file("sample.txt", ItemId::root(), FILE_MODE);
        inode.id = ItemId::new(id);
        inode
    }

    fn sample_session(id: &str) -> UploadSession {
        UploadSession::new(
            ItemId::new(id),
            ItemId::root(),
            "sample.txt",
            8 * 1024 * 1024,
            4 * 1024 * 1024,
            Some("etag-1".into()),
            "hash",
            UploadPriority::Foreground,
        )
    }

    #[tokio::test]
    async fn test_inode_roundtrip() {
        let store = open_store().await;
        let inode = sample_inode("A1");

        store.put_inode(&inode).await.unwrap();
        let loaded = store.get_inode(&inode.id).await.unwrap().unwrap();
        assert_eq!(loaded, inode);

        store.delete_inode(&inode.id).await.unwrap();
        assert!(store.get_inode(&inode.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_inode_is_idempotent() {
        let store = open_store().await;
        let mut inode = sample_inode("A2");

        store.put_inode(&inode).await.unwrap();
        inode.size = 4096;
        store.put_inode(&inode).await.unwrap();

        let loaded = store.get_inode(&inode.id).await.unwrap().unwrap();
        assert_eq!(loaded.size, 4096);
        assert_eq!(store.all_inodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_journal_roundtrip() {
        let store = open_store().await;
        let mut session = sample_session("U1");
        session.offset = 20 * 1024 * 1024;
        session.upload_url = Some("https://up.example/session/1".into());
        session.state = UploadState::InFlight;

        store.put_upload(&session).await.unwrap();
        let loaded = store.get_upload(&session.item_id).await.unwrap().unwrap();
        assert_eq!(loaded.offset, 20 * 1024 * 1024);
        assert_eq!(loaded.upload_url.as_deref(), Some("https://up.example/session/1"));

        store.delete_upload(&session.item_id).await.unwrap();
        assert!(store.all_uploads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delta_cursor_roundtrip() {
        let store = open_store().await;
        assert!(store.get_delta_cursor("drive-1").await.unwrap().is_none());

        store.put_delta_cursor("drive-1", "token-1").await.unwrap();
        store.put_delta_cursor("drive-1", "token-2").await.unwrap();
        assert_eq!(
            store.get_delta_cursor("drive-1").await.unwrap().as_deref(),
            Some("token-2")
        );

        // cursors are scoped per drive
        assert!(store.get_delta_cursor("drive-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_thumbnail_roundtrip() {
        let store = open_store().await;
        let id = ItemId::new("T1");
        store.put_thumbnail(&id, &[0xFF, 0xD8, 0xFF]).await.unwrap();
        assert_eq!(
            store.get_thumbnail(&id).await.unwrap().unwrap(),
            vec![0xFF, 0xD8, 0xFF]
        );
        store.delete_thumbnail(&id).await.unwrap();
        assert!(store.get_thumbnail(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_snapshot_replaces() {
        let store = open_store().await;
        store
            .snapshot_offline(&[sample_inode("O1"), sample_inode("O2")])
            .await
            .unwrap();
        assert_eq!(store.load_offline().await.unwrap().len(), 2);

        store.snapshot_offline(&[sample_inode("O3")]).await.unwrap();
        let snapshot = store.load_offline().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id.as_str(), "O3");
    }

    #[tokio::test]
    async fn test_batch_commit() {
        let store = open_store().await;

        let mut batch = store.begin().await.unwrap();
        batch.put_inode(&sample_inode("B1")).await.unwrap();
        batch.put_upload(&sample_session("B1")).await.unwrap();
        batch.commit().await.unwrap();

        assert!(store.get_inode(&ItemId::new("B1")).await.unwrap().is_some());
        assert!(store.get_upload(&ItemId::new("B1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_batch_rollback_discards_writes() {
        let store = open_store().await;

        let mut batch = store.begin().await.unwrap();
        batch.put_inode(&sample_inode("R1")).await.unwrap();
        batch.rollback().await.unwrap();

        assert!(store.get_inode(&ItemId::new("R1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_drop_rolls_back() {
        let store = open_store().await;

        {
            let mut batch = store.begin().await.unwrap();
            batch.put_inode(&sample_inode("R2")).await.unwrap();
            // dropped without commit
        }

        assert!(store.get_inode(&ItemId::new("R2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = open_store().await;

        let mut a = sample_inode("S1");
        a.status = FileStatus::Cloud;
        a.flags.has_changes = false;
        let mut b = sample_inode("S2");
        b.status = FileStatus::Cloud;
        b.flags.has_changes = false;
        let c = sample_inode("S3"); // LocalModified

        for inode in [&a, &b, &c] {
            store.put_inode(inode).await.unwrap();
        }

        let counts = store.status_counts().await.unwrap();
        assert!(counts.contains(&("cloud".to_string(), 2)));
        assert!(counts.contains(&("local_modified".to_string(), 1)));
    }

    #[tokio::test]
    async fn test_recovery_scan_sees_incomplete_sessions() {
        let store = open_store().await;

        let mut pending = sample_session("P1");
        pending.state = UploadState::Pending;
        let mut inflight = sample_session("P2");
        inflight.state = UploadState::InFlight;
        let mut done = sample_session("P3");
        done.state = UploadState::Completed;

        for s in [&pending, &inflight, &done] {
            store.put_upload(s).await.unwrap();
        }

        let resumable: Vec<_> = store
            .all_uploads()
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.is_resumable())
            .collect();
        assert_eq!(resumable.len(), 2);
    }
}
