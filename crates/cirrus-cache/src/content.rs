//! On-disk content store keyed by item id.
//!
//! Content lives at `{content_dir}/{first_2_chars_of_sha256(id)}/{rest}`.
//! In-progress downloads are staged under `tmp/` and renamed into place
//! only after the QuickXOR digest matched, so `content/` never holds a
//! torn body.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use cirrus_core::domain::{CoreError, ItemId};
use cirrus_core::hash::QuickXorHash;
use sha2::{Digest, Sha256};

/// Read buffer size for hashing cached bodies.
const HASH_BUF: usize = 64 * 1024;

/// Manages cached file bodies on disk.
pub struct ContentCache {
    content_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl ContentCache {
    /// Creates the cache, creating `content/` and `tmp/` if needed. Any
    /// staging leftovers from a previous crash are discarded.
    pub fn new(content_dir: PathBuf, tmp_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&content_dir)?;
        // stale partial downloads are worthless after a restart
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            content_dir,
            tmp_dir,
        })
    }

    /// Computes the on-disk path for an item id.
    pub fn path_for(&self, id: &ItemId) -> PathBuf {
        let hash = Self::hash_id(id);
        let (prefix, rest) = hash.split_at(2);
        self.content_dir.join(prefix).join(rest)
    }

    /// Opens the body for an id, creating an empty file if absent.
    pub fn open_or_create(&self, id: &ItemId) -> Result<File, CoreError> {
        let path = self.path_for(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(file)
    }

    /// True if a body exists for the id.
    pub fn exists(&self, id: &ItemId) -> bool {
        self.path_for(id).exists()
    }

    /// Size of the cached body, or `None` if absent.
    pub fn size(&self, id: &ItemId) -> Option<u64> {
        fs::metadata(self.path_for(id)).ok().map(|m| m.len())
    }

    /// Reads up to `size` bytes at `offset`. Reads past EOF return the
    /// available prefix.
    pub fn read_at(&self, id: &ItemId, offset: u64, size: u32) -> Result<Vec<u8>, CoreError> {
        let path = self.path_for(id);
        let mut file = File::open(&path)
            .map_err(|_| CoreError::NotFound(format!("no cached body for {id}")))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Writes `data` at `offset`, creating the body if needed. Returns the
    /// number of bytes written.
    pub fn write_at(&self, id: &ItemId, offset: u64, data: &[u8]) -> Result<u32, CoreError> {
        let mut file = self.open_or_create(id)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len() as u32)
    }

    /// Truncates (or extends with zeros) the body to `size` bytes.
    pub fn truncate(&self, id: &ItemId, size: u64) -> Result<(), CoreError> {
        let file = self.open_or_create(id)?;
        file.set_len(size)?;
        Ok(())
    }

    /// Reads the whole body.
    pub fn read_all(&self, id: &ItemId) -> Result<Vec<u8>, CoreError> {
        let path = self.path_for(id);
        fs::read(&path).map_err(|_| CoreError::NotFound(format!("no cached body for {id}")))
    }

    /// Removes the body for an id. Removing an absent id is a no-op.
    pub fn delete(&self, id: &ItemId) -> Result<(), CoreError> {
        let path = self.path_for(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Moves a body to a new id (used when a local-only id is remapped to
    /// the server-assigned id after the first upload).
    pub fn rename_id(&self, old: &ItemId, new: &ItemId) -> Result<(), CoreError> {
        let from = self.path_for(old);
        if !from.exists() {
            return Ok(());
        }
        let to = self.path_for(new);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(from, to)?;
        Ok(())
    }

    /// Total bytes of cached content on disk.
    pub fn used_bytes(&self) -> Result<u64, CoreError> {
        let mut total = 0u64;
        if self.content_dir.exists() {
            for entry in fs::read_dir(&self.content_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    for file in fs::read_dir(entry.path())? {
                        let file = file?;
                        if file.file_type()?.is_file() {
                            total += file.metadata()?.len();
                        }
                    }
                }
            }
        }
        Ok(total)
    }

    /// Computes the QuickXOR digest of the cached body.
    pub fn hash_of(&self, id: &ItemId) -> Result<String, CoreError> {
        let path = self.path_for(id);
        let mut file = File::open(&path)
            .map_err(|_| CoreError::NotFound(format!("no cached body for {id}")))?;
        let mut hasher = QuickXorHash::new();
        let mut buf = vec![0u8; HASH_BUF];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize_base64())
    }

    /// Verifies the cached body against an expected digest. A mismatch is
    /// reported, not auto-healed; the caller re-downloads.
    pub fn verify(&self, id: &ItemId, expected: &str) -> Result<bool, CoreError> {
        Ok(self.hash_of(id)? == expected)
    }

    /// Begins a staged write in `tmp/` for a download in progress.
    pub fn begin_staging(&self, id: &ItemId) -> Result<StagedDownload, CoreError> {
        let tmp_path = self.tmp_dir.join(Self::hash_id(id));
        let file = File::create(&tmp_path)?;
        Ok(StagedDownload {
            id: id.clone(),
            tmp_path,
            final_path: self.path_for(id),
            file,
            hasher: QuickXorHash::new(),
            written: 0,
        })
    }

    fn hash_id(id: &ItemId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// A download being streamed into the staging area.
///
/// Bytes are hashed as they are written; [`StagedDownload::commit`]
/// verifies the digest and atomically renames the file into `content/`.
pub struct StagedDownload {
    id: ItemId,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
    hasher: QuickXorHash,
    written: u64,
}

impl StagedDownload {
    /// Appends a chunk to the staged file.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), CoreError> {
        self.file.write_all(chunk)?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes staged so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verifies against `expected` (when given) and promotes the staged
    /// file into the content directory. Returns the computed digest.
    ///
    /// # Errors
    ///
    /// `CoreError::Transient` on digest mismatch (the transfer is retried
    /// with the staged bytes discarded), `CoreError::Storage` on rename
    /// failure.
    pub fn commit(self, expected: Option<&str>) -> Result<String, CoreError> {
        let digest = self.hasher.finalize_base64();
        if let Some(expected) = expected {
            if digest != expected {
                let _ = fs::remove_file(&self.tmp_path);
                return Err(CoreError::Transient(format!(
                    "hash mismatch for {}: got {digest}, expected {expected}",
                    self.id
                )));
            }
        }
        self.file.sync_all()?;
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(digest)
    }

    /// Discards the staged bytes.
    pub fn abort(self) {
        let _ = fs::remove_file(&self.tmp_path);
    }

    /// Path of the staging file (diagnostics only).
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }
}

#[cfg(test)]
mod tests {
    use cirrus_core::hash::QuickXorHash;
    use tempfile::tempdir;

    use super::*;

    fn make_cache(dir: &Path) -> ContentCache {
        ContentCache::new(dir.join("content"), dir.join("tmp")).unwrap()
    }

    #[test]
    fn test_fanout_layout() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("ITEM-123");

        let path = cache.path_for(&id);
        let parent = path.parent().unwrap();
        assert_eq!(parent.parent().unwrap(), dir.path().join("content"));
        assert_eq!(parent.file_name().unwrap().len(), 2);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("RT");

        cache.write_at(&id, 0, b"Hello, CirrusFS!").unwrap();
        assert_eq!(cache.read_at(&id, 0, 16).unwrap(), b"Hello, CirrusFS!");
        assert_eq!(cache.read_at(&id, 7, 8).unwrap(), b"CirrusFS");
        assert_eq!(cache.size(&id), Some(16));
    }

    #[test]
    fn test_read_past_eof_returns_prefix() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("EOF");

        cache.write_at(&id, 0, b"short").unwrap();
        assert_eq!(cache.read_at(&id, 0, 1024).unwrap(), b"short");
        assert!(cache.read_at(&id, 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_sparse_write_and_truncate() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("SPARSE");

        cache.write_at(&id, 4, b"abcd").unwrap();
        assert_eq!(cache.size(&id), Some(8));
        assert_eq!(cache.read_at(&id, 0, 4).unwrap(), vec![0u8; 4]);

        cache.truncate(&id, 2).unwrap();
        assert_eq!(cache.size(&id), Some(2));
    }

    #[test]
    fn test_delete_and_exists() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("DEL");

        assert!(!cache.exists(&id));
        cache.write_at(&id, 0, b"x").unwrap();
        assert!(cache.exists(&id));

        cache.delete(&id).unwrap();
        assert!(!cache.exists(&id));
        // deleting again is a no-op
        cache.delete(&id).unwrap();
    }

    #[test]
    fn test_rename_id_moves_body() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let old = ItemId::new_local();
        let new = ItemId::new("SERVER-9");

        cache.write_at(&old, 0, b"payload").unwrap();
        cache.rename_id(&old, &new).unwrap();

        assert!(!cache.exists(&old));
        assert_eq!(cache.read_all(&new).unwrap(), b"payload");
    }

    #[test]
    fn test_hash_and_verify() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("HASH");
        let body = b"verify me".to_vec();

        cache.write_at(&id, 0, &body).unwrap();
        let expected = QuickXorHash::digest(&body);

        assert_eq!(cache.hash_of(&id).unwrap(), expected);
        assert!(cache.verify(&id, &expected).unwrap());
        assert!(!cache.verify(&id, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=").unwrap());
    }

    #[test]
    fn test_staged_commit_promotes_atomically() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("STAGE");
        let body = b"streamed body".to_vec();
        let expected = QuickXorHash::digest(&body);

        let mut staged = cache.begin_staging(&id).unwrap();
        staged.write(&body[..8]).unwrap();
        staged.write(&body[8..]).unwrap();
        assert_eq!(staged.written(), body.len() as u64);
        assert!(!cache.exists(&id)); // not visible until commit

        let digest = staged.commit(Some(&expected)).unwrap();
        assert_eq!(digest, expected);
        assert!(cache.exists(&id));
        assert_eq!(cache.read_all(&id).unwrap(), body);
    }

    #[test]
    fn test_staged_commit_rejects_hash_mismatch() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("BADHASH");

        let mut staged = cache.begin_staging(&id).unwrap();
        staged.write(b"corrupted in flight").unwrap();
        let err = staged
            .commit(Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA="))
            .unwrap_err();

        assert!(matches!(err, CoreError::Transient(_)));
        assert!(!cache.exists(&id));
    }

    #[test]
    fn test_staged_abort_leaves_nothing() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("ABORT");

        let mut staged = cache.begin_staging(&id).unwrap();
        staged.write(b"half a download").unwrap();
        let tmp = staged.tmp_path().to_path_buf();
        staged.abort();

        assert!(!tmp.exists());
        assert!(!cache.exists(&id));
    }

    #[test]
    fn test_restart_discards_stale_staging() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());
        let id = ItemId::new("STALE");
        let mut staged = cache.begin_staging(&id).unwrap();
        staged.write(b"interrupted").unwrap();
        let tmp = staged.tmp_path().to_path_buf();
        std::mem::forget(staged); // simulate a crash mid-download
        assert!(tmp.exists());

        let _cache = make_cache(dir.path());
        assert!(!tmp.exists());
    }

    #[test]
    fn test_used_bytes_accounts_all_entries() {
        let dir = tempdir().unwrap();
        let cache = make_cache(dir.path());

        cache.write_at(&ItemId::new("U1"), 0, &[0u8; 100]).unwrap();
        cache.write_at(&ItemId::new("U2"), 0, &[0u8; 50]).unwrap();
        assert_eq!(cache.used_bytes().unwrap(), 150);
    }
}
