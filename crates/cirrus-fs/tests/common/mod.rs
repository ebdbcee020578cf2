//! In-memory fake of the remote drive, plus the mount harness used by the
//! scenario tests. Every scenario runs without network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cirrus_core::config::Config;
use cirrus_core::domain::{CoreError, ItemId, ItemKind};
use cirrus_core::hash::QuickXorHash;
use cirrus_core::ports::auth::StaticToken;
use cirrus_core::ports::{
    ChildPage, ChunkOutcome, ConflictBehavior, DeltaPage, DownloadOutcome, ItemPatch,
    Reachability, RemoteDrive, RemoteItem, UploadSessionInfo, UploadTarget,
};
use cirrus_fs::{Filesystem, FilesystemOptions};
use cirrus_store::DatabasePool;

/// Simulated per-download latency so concurrency is observable.
const DOWNLOAD_DELAY: Duration = Duration::from_millis(25);

#[derive(Default)]
struct DriveState {
    items: HashMap<ItemId, RemoteItem>,
    bodies: HashMap<ItemId, Bytes>,
    /// Every mutation appended in order; a delta cursor is an index here
    changes: Vec<RemoteItem>,
    sessions: HashMap<String, FakeSession>,
    next_id: u64,
    next_etag: u64,
    next_session: u64,
}

struct FakeSession {
    target: UploadTarget,
    received: Vec<u8>,
}

/// In-memory `RemoteDrive` with a change log, resumable upload sessions,
/// and a call journal for assertions.
pub struct FakeDrive {
    state: Mutex<DriveState>,
    fail_transport: AtomicBool,
    calls: Mutex<Vec<String>>,
    downloads_in_flight: AtomicUsize,
    max_concurrent_downloads: AtomicUsize,
}

impl FakeDrive {
    pub fn new() -> Arc<Self> {
        let drive = Self {
            state: Mutex::new(DriveState::default()),
            fail_transport: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            downloads_in_flight: AtomicUsize::new(0),
            max_concurrent_downloads: AtomicUsize::new(0),
        };
        {
            let mut state = drive.state.lock().unwrap();
            let root = RemoteItem {
                id: ItemId::root(),
                name: String::new(),
                parent_id: None,
                size: 0,
                etag: Some("root-e1".into()),
                hash: None,
                mime: None,
                created: None,
                modified: None,
                kind: ItemKind::Folder,
                deleted: false,
            };
            state.items.insert(root.id.clone(), root);
        }
        Arc::new(drive)
    }

    // ---- test controls -------------------------------------------------

    pub fn set_transport_failing(&self, failing: bool) {
        self.fail_transport.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads.load(Ordering::SeqCst)
    }

    /// Seeds a folder and records it in the change log.
    pub fn add_folder(&self, id: &str, name: &str, parent: &str) {
        let mut state = self.state.lock().unwrap();
        let etag = Self::bump_etag(&mut state);
        let item = RemoteItem {
            id: ItemId::new(id),
            name: name.into(),
            parent_id: Some(ItemId::new(parent)),
            size: 0,
            etag: Some(etag),
            hash: None,
            mime: None,
            created: None,
            modified: None,
            kind: ItemKind::Folder,
            deleted: false,
        };
        state.items.insert(item.id.clone(), item.clone());
        state.changes.push(item);
    }

    /// Seeds a file and records it in the change log.
    pub fn add_file(&self, id: &str, name: &str, parent: &str, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let etag = Self::bump_etag(&mut state);
        let item = RemoteItem {
            id: ItemId::new(id),
            name: name.into(),
            parent_id: Some(ItemId::new(parent)),
            size: body.len() as u64,
            etag: Some(etag),
            hash: Some(QuickXorHash::digest(body)),
            mime: Some("application/octet-stream".into()),
            created: None,
            modified: None,
            kind: ItemKind::File,
            deleted: false,
        };
        state.bodies.insert(item.id.clone(), Bytes::copy_from_slice(body));
        state.items.insert(item.id.clone(), item.clone());
        state.changes.push(item);
    }

    /// Server-side edit: new body, new etag, change-log entry.
    pub fn update_file(&self, id: &str, body: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let etag = Self::bump_etag(&mut state);
        let id = ItemId::new(id);
        let item = state.items.get_mut(&id).expect("update of unknown item");
        item.etag = Some(etag);
        item.size = body.len() as u64;
        item.hash = Some(QuickXorHash::digest(body));
        let snapshot = item.clone();
        state.bodies.insert(id, Bytes::copy_from_slice(body));
        state.changes.push(snapshot);
    }

    /// Server-side delete: tombstone in the change log.
    pub fn delete_file(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        let id = ItemId::new(id);
        if let Some(mut item) = state.items.remove(&id) {
            state.bodies.remove(&id);
            item.deleted = true;
            state.changes.push(item);
        }
    }

    /// Registers a half-finished upload session (crash-resume tests).
    pub fn seed_session(&self, url: &str, target_id: &str, already_received: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(
            url.to_string(),
            FakeSession {
                target: UploadTarget::Item(ItemId::new(target_id)),
                received: already_received.to_vec(),
            },
        );
    }

    pub fn remote_etag(&self, id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.items.get(&ItemId::new(id)).and_then(|i| i.etag.clone())
    }

    pub fn remote_body(&self, id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.bodies.get(&ItemId::new(id)).map(|b| b.to_vec())
    }

    pub fn remote_hash(&self, id: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.items.get(&ItemId::new(id)).and_then(|i| i.hash.clone())
    }

    /// Finds a live item id by name (for adopted creates).
    pub fn id_by_name(&self, name: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .items
            .values()
            .find(|i| i.name == name)
            .map(|i| i.id.as_str().to_string())
    }

    pub fn live_file_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .items
            .values()
            .filter(|i| i.kind == ItemKind::File)
            .count()
    }

    // ---- internals -----------------------------------------------------

    fn bump_etag(state: &mut DriveState) -> String {
        state.next_etag += 1;
        format!("e{}", state.next_etag)
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    fn check_transport(&self) -> Result<(), CoreError> {
        if self.fail_transport.load(Ordering::SeqCst) {
            Err(CoreError::Transient("simulated network failure".into()))
        } else {
            Ok(())
        }
    }

    fn finalize_upload(
        state: &mut DriveState,
        target: &UploadTarget,
        body: Vec<u8>,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError> {
        match target {
            UploadTarget::Item(id) => {
                let current = state
                    .items
                    .get(id)
                    .cloned()
                    .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
                if let Some(expected) = if_match {
                    if current.etag.as_deref() != Some(expected) {
                        return Err(CoreError::Precondition(format!(
                            "etag is {:?}, not {expected:?}",
                            current.etag
                        )));
                    }
                }
                let etag = Self::bump_etag(state);
                let item = state.items.get_mut(id).expect("checked above");
                item.etag = Some(etag);
                item.size = body.len() as u64;
                item.hash = Some(QuickXorHash::digest(&body));
                let snapshot = item.clone();
                state.bodies.insert(id.clone(), Bytes::from(body));
                state.changes.push(snapshot.clone());
                Ok(snapshot)
            }
            UploadTarget::ChildOf { parent, name } => {
                if !state.items.contains_key(parent) {
                    return Err(CoreError::NotFound(parent.to_string()));
                }
                let existing = state
                    .items
                    .values()
                    .find(|i| i.parent_id.as_ref() == Some(parent) && &i.name == name)
                    .map(|i| i.id.clone());
                let id = match existing {
                    Some(id) => id,
                    None => {
                        state.next_id += 1;
                        ItemId::new(format!("srv-{}", state.next_id))
                    }
                };
                let etag = Self::bump_etag(state);
                let item = RemoteItem {
                    id: id.clone(),
                    name: name.clone(),
                    parent_id: Some(parent.clone()),
                    size: body.len() as u64,
                    etag: Some(etag),
                    hash: Some(QuickXorHash::digest(&body)),
                    mime: Some("application/octet-stream".into()),
                    created: None,
                    modified: None,
                    kind: ItemKind::File,
                    deleted: false,
                };
                state.bodies.insert(id.clone(), Bytes::from(body));
                state.items.insert(id, item.clone());
                state.changes.push(item.clone());
                Ok(item)
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteDrive for FakeDrive {
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, CoreError> {
        self.check_transport()?;
        self.log(format!("get_item:{id}"));
        let state = self.state.lock().unwrap();
        state
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, CoreError> {
        self.check_transport()?;
        self.log(format!("get_item_by_path:{path}"));
        let state = self.state.lock().unwrap();
        let mut current = ItemId::root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let child = state
                .items
                .values()
                .find(|i| i.parent_id.as_ref() == Some(&current) && i.name == segment)
                .ok_or_else(|| CoreError::NotFound(path.to_string()))?;
            current = child.id.clone();
        }
        state
            .items
            .get(&current)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(path.to_string()))
    }

    async fn list_children(
        &self,
        id: &ItemId,
        _page: Option<&str>,
    ) -> Result<ChildPage, CoreError> {
        self.check_transport()?;
        self.log(format!("list_children:{id}"));
        let state = self.state.lock().unwrap();
        if !state.items.contains_key(id) {
            return Err(CoreError::NotFound(id.to_string()));
        }
        let items = state
            .items
            .values()
            .filter(|i| i.parent_id.as_ref() == Some(id))
            .cloned()
            .collect();
        Ok(ChildPage {
            items,
            next_page: None,
        })
    }

    async fn download(
        &self,
        id: &ItemId,
        if_none_match: Option<&str>,
    ) -> Result<DownloadOutcome, CoreError> {
        self.check_transport()?;
        let in_flight = self.downloads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_downloads
            .fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(DOWNLOAD_DELAY).await;

        let outcome = {
            let state = self.state.lock().unwrap();
            match state.items.get(id) {
                None => Err(CoreError::NotFound(id.to_string())),
                Some(item) => {
                    if if_none_match.is_some() && item.etag.as_deref() == if_none_match {
                        self.log(format!("download:{id}:304"));
                        Ok(DownloadOutcome::NotModified)
                    } else {
                        self.log(format!("download:{id}:200"));
                        let body = state.bodies.get(id).cloned().unwrap_or_default();
                        Ok(DownloadOutcome::Full(body))
                    }
                }
            }
        };
        self.downloads_in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn upload_small(
        &self,
        target: &UploadTarget,
        body: Bytes,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError> {
        self.check_transport()?;
        self.log(match target {
            UploadTarget::Item(id) => format!("upload_small:item:{id}"),
            UploadTarget::ChildOf { name, .. } => format!("upload_small:child:{name}"),
        });
        let mut state = self.state.lock().unwrap();
        Self::finalize_upload(&mut state, target, body.to_vec(), if_match)
    }

    async fn create_upload_session(
        &self,
        target: &UploadTarget,
        _behavior: ConflictBehavior,
    ) -> Result<UploadSessionInfo, CoreError> {
        self.check_transport()?;
        self.log("create_session".to_string());
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let url = format!("fake://session/{}", state.next_session);
        state.sessions.insert(
            url.clone(),
            FakeSession {
                target: target.clone(),
                received: Vec::new(),
            },
        );
        Ok(UploadSessionInfo {
            upload_url: url,
            expires: None,
            chunk_alignment: 320 * 1024,
        })
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        chunk: Bytes,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome, CoreError> {
        self.check_transport()?;
        self.log(format!("put_chunk:{offset}"));
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(upload_url)
            .ok_or_else(|| CoreError::NotFound(format!("session {upload_url}")))?;
        if offset != session.received.len() as u64 {
            return Err(CoreError::Invalid(format!(
                "expected offset {}, got {offset}",
                session.received.len()
            )));
        }
        session.received.extend_from_slice(&chunk);
        if (session.received.len() as u64) < total {
            return Ok(ChunkOutcome::Accepted {
                next_offset: session.received.len() as u64,
            });
        }
        let session = state
            .sessions
            .remove(upload_url)
            .ok_or_else(|| CoreError::NotFound(format!("session {upload_url}")))?;
        let item = Self::finalize_upload(&mut state, &session.target, session.received, None)?;
        Ok(ChunkOutcome::Complete(item))
    }

    async fn cancel_upload_session(&self, upload_url: &str) -> Result<(), CoreError> {
        self.log(format!("cancel_session:{upload_url}"));
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(upload_url);
        Ok(())
    }

    async fn create_folder(&self, parent: &ItemId, name: &str) -> Result<RemoteItem, CoreError> {
        self.check_transport()?;
        self.log(format!("create_folder:{name}"));
        let mut state = self.state.lock().unwrap();
        if !state.items.contains_key(parent) {
            return Err(CoreError::NotFound(parent.to_string()));
        }
        if state
            .items
            .values()
            .any(|i| i.parent_id.as_ref() == Some(parent) && i.name == name)
        {
            return Err(CoreError::Conflict(format!("{name} exists")));
        }
        state.next_id += 1;
        let id = ItemId::new(format!("srv-{}", state.next_id));
        let etag = Self::bump_etag(&mut state);
        let item = RemoteItem {
            id: id.clone(),
            name: name.into(),
            parent_id: Some(parent.clone()),
            size: 0,
            etag: Some(etag),
            hash: None,
            mime: None,
            created: None,
            modified: None,
            kind: ItemKind::Folder,
            deleted: false,
        };
        state.items.insert(id, item.clone());
        state.changes.push(item.clone());
        Ok(item)
    }

    async fn patch(
        &self,
        id: &ItemId,
        fields: &ItemPatch,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, CoreError> {
        self.check_transport()?;
        self.log(format!("patch:{id}"));
        let mut state = self.state.lock().unwrap();
        let current = state
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if let Some(expected) = if_match {
            if current.etag.as_deref() != Some(expected) {
                return Err(CoreError::Precondition("etag moved".into()));
            }
        }
        let etag = Self::bump_etag(&mut state);
        let item = state.items.get_mut(id).expect("checked above");
        if let Some(name) = &fields.name {
            item.name = name.clone();
        }
        if let Some(parent) = &fields.parent_id {
            item.parent_id = Some(parent.clone());
        }
        item.etag = Some(etag);
        let snapshot = item.clone();
        state.changes.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn delete(&self, id: &ItemId, _if_match: Option<&str>) -> Result<(), CoreError> {
        self.check_transport()?;
        self.log(format!("delete:{id}"));
        let mut state = self.state.lock().unwrap();
        match state.items.remove(id) {
            Some(mut item) => {
                state.bodies.remove(id);
                item.deleted = true;
                state.changes.push(item);
                Ok(())
            }
            None => Err(CoreError::NotFound(id.to_string())),
        }
    }

    async fn delta(&self, _drive_id: &str, cursor: Option<&str>) -> Result<DeltaPage, CoreError> {
        self.check_transport()?;
        self.log("delta".to_string());
        let state = self.state.lock().unwrap();
        let from = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let from = from.min(state.changes.len());
        Ok(DeltaPage {
            items: state.changes[from..].to_vec(),
            next_page: None,
            final_cursor: Some(state.changes.len().to_string()),
        })
    }

    async fn probe(&self) -> Reachability {
        if self.fail_transport.load(Ordering::SeqCst) {
            Reachability::Unreachable
        } else {
            Reachability::Reachable
        }
    }
}

/// A mounted core over a fake drive plus its backing pool (tests reach
/// into the store through the pool when a scenario calls for it).
pub struct Harness {
    pub fs: Arc<Filesystem>,
    pub fake: Arc<FakeDrive>,
    pub pool: DatabasePool,
    pub dir: tempfile::TempDir,
}

/// Test configuration: tight timeouts, tiny small-upload cutoff left at
/// the default, long delta interval so polls are test-driven.
pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.mount_point = dir.path().join("mnt");
    config.cache_dir = dir.path().join("state");
    config.drive_id = "testdrive".into();
    config.auth_token_path = dir.path().join("tokens.json");
    config.request_timeout = 5;
    config.delta_interval_active = 3600;
    config.delta_interval_idle = 3600;
    config.upload_backoff_cap = 1;
    config
}

/// Builds a core over the fake, starts the background machinery, and
/// runs the initial delta poll so seeded items are visible.
pub async fn mount(fake: Arc<FakeDrive>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    mount_with_config(fake, test_config(&dir), dir).await
}

pub async fn mount_with_config(
    fake: Arc<FakeDrive>,
    config: Config,
    dir: tempfile::TempDir,
) -> Harness {
    let pool = DatabasePool::in_memory().await.expect("pool");
    let fs = Filesystem::new(
        FilesystemOptions { config },
        &pool,
        fake.clone(),
        Arc::new(StaticToken("test-token".into())),
    )
    .await
    .expect("filesystem");
    fs.start();
    fs.delta().poll_once().await.expect("initial delta");
    Harness {
        fs,
        fake,
        pool,
        dir,
    }
}

/// Polls until `predicate` holds or the deadline passes.
pub async fn wait_until<F>(deadline: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within {deadline:?}");
}
