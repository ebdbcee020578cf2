//! End-to-end scenarios over the in-memory fake drive: on-demand reads,
//! upload round-trips, conflicts, tombstones while open, crash resumption,
//! and offline/online transitions. No network anywhere.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cirrus_core::domain::{
    item::FILE_MODE, FileStatus, Inode, ItemId, UploadPriority, UploadSession, UploadState,
};
use cirrus_core::hash::QuickXorHash;
use cirrus_cache::ContentCache;
use cirrus_store::{DatabasePool, MetadataStore};

use common::{mount, mount_with_config, test_config, wait_until, FakeDrive, Harness};

const WAIT: Duration = Duration::from_secs(10);

async fn wait_for_status(harness: &Harness, id: &ItemId, status: FileStatus) {
    let fs = &harness.fs;
    let id = id.clone();
    let start = std::time::Instant::now();
    while start.elapsed() < WAIT {
        if fs.getattr(&id).map(|r| r.status) == Ok(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "inode {id} never reached {status}, is {:?}",
        fs.getattr(&id).map(|r| r.status)
    );
}

// ============================================================================
// S1: on-demand read
// ============================================================================

#[tokio::test]
async fn s1_open_downloads_on_demand() {
    let fake = FakeDrive::new();
    let body = vec![0xABu8; 1024];
    fake.add_file("X", "x.bin", "root", &body);
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let mut events = fs.status_bus().subscribe();
    let id = ItemId::new("X");
    assert_eq!(fs.getattr(&id).unwrap().status, FileStatus::Cloud);

    let fh = fs.open(&id, false, false).await.unwrap();
    assert_eq!(fs.read(fh, 0, 1024).unwrap(), body);
    assert_eq!(fs.getattr(&id).unwrap().status, FileStatus::Cached);

    // the local hash equals the server-reported hash
    assert_eq!(
        fs.getattr(&id).unwrap().hash.unwrap(),
        QuickXorHash::digest(&body)
    );

    // exactly one unconditional 200 download
    assert_eq!(harness.fake.calls_matching("download:X:200"), 1);
    assert_eq!(harness.fake.calls_matching("download:X:304"), 0);

    // emitted transitions: Downloading then Cached, in order
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.path == "/x.bin" {
            seen.push(event.status);
        }
    }
    assert_eq!(seen, vec![FileStatus::Downloading, FileStatus::Cached]);

    fs.release(fh).await.unwrap();
}

// ============================================================================
// S2 / R1: create, write, close, small upload, read back
// ============================================================================

#[tokio::test]
async fn s2_create_close_uploads_and_remaps_id() {
    let fake = FakeDrive::new();
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let mut events = fs.status_bus().subscribe();
    let root = fs.root_id();
    let (inode, fh) = fs.create(&root, "note.txt", FILE_MODE).await.unwrap();
    assert!(inode.id.is_local());

    fs.write(fh, 0, b"hello").await.unwrap();
    fs.release(fh).await.unwrap();

    // the upload lands and the local-only id is remapped to the server id
    wait_until(WAIT, || harness.fake.id_by_name("note.txt").is_some()).await;
    let server_id = harness.fake.id_by_name("note.txt").unwrap();
    let id = ItemId::new(server_id);
    wait_for_status(&harness, &id, FileStatus::Cached).await;

    let record = fs.getattr(&id).unwrap();
    assert!(!record.id.is_local());
    assert_eq!(record.size, 5);
    assert_eq!(record.etag, harness.fake.remote_etag(id.as_str()));
    assert_eq!(record.hash.as_deref(), Some(&QuickXorHash::digest(b"hello")[..]));
    assert_eq!(harness.fake.remote_body(id.as_str()).unwrap(), b"hello");

    // R1: read-back through a fresh handle yields identical bytes
    let fh = fs.open(&id, false, false).await.unwrap();
    assert_eq!(fs.read(fh, 0, 5).unwrap(), b"hello");
    fs.release(fh).await.unwrap();

    // P5: the event stream for this path is a valid machine path
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.path == "/note.txt" {
            seen.push(event.status);
        }
    }
    assert_eq!(
        seen,
        vec![
            FileStatus::LocalModified,
            FileStatus::Uploading,
            FileStatus::Cached,
        ]
    );
}

// ============================================================================
// S3: conflict on update
// ============================================================================

#[tokio::test]
async fn s3_etag_conflict_preserves_local_copy() {
    let fake = FakeDrive::new();
    fake.add_file("Z", "z.txt", "root", b"orig");
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let id = ItemId::new("Z");
    let mut events = fs.status_bus().subscribe();

    // local edit: truncate-open and rewrite
    let fh = fs.open(&id, true, true).await.unwrap();
    fs.write(fh, 0, b"A").await.unwrap();

    // the remote moves on before our upload is dispatched
    harness.fake.update_file("Z", b"B");

    fs.release(fh).await.unwrap();

    // a conflict copy appears remotely next to the original
    wait_until(WAIT, || harness.fake.live_file_count() == 2).await;

    // original id: refreshed from the remote, body dropped locally
    wait_for_status(&harness, &id, FileStatus::Cloud).await;
    let record = fs.getattr(&id).unwrap();
    assert_eq!(record.etag, harness.fake.remote_etag("Z"));
    assert!(!record.flags.has_changes);

    // the preserved copy carries the conflict stamp and the local bytes
    let children = fs.readdir(&fs.root_id()).await.unwrap();
    let copy = children
        .iter()
        .find(|c| c.name.contains("(conflict "))
        .expect("conflict copy listed");
    let copy_remote = harness
        .fake
        .id_by_name(&copy.name)
        .expect("conflict copy uploaded");
    assert_eq!(harness.fake.remote_body(&copy_remote).unwrap(), b"A");

    // original path transitions include Uploading -> Conflict
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.path == "/z.txt" {
            seen.push(event.status);
        }
    }
    let uploading = seen.iter().position(|s| *s == FileStatus::Uploading);
    let conflict = seen.iter().position(|s| *s == FileStatus::Conflict);
    assert!(uploading.is_some() && conflict.is_some());
    assert!(uploading < conflict);
}

// ============================================================================
// S4 / B4: deletion while a handle is open
// ============================================================================

#[tokio::test]
async fn s4_remote_delete_while_open_defers_cleanup() {
    let fake = FakeDrive::new();
    fake.add_file("W", "w.dat", "root", b"still readable");
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let id = ItemId::new("W");
    let fh = fs.open(&id, false, false).await.unwrap();

    harness.fake.delete_file("W");
    fs.delta().poll_once().await.unwrap();

    // reads on the open handle keep serving cached bytes
    assert_eq!(fs.read(fh, 0, 14).unwrap(), b"still readable");
    // the listing no longer shows the file
    assert!(fs
        .readdir(&fs.root_id())
        .await
        .unwrap()
        .iter()
        .all(|c| c.name != "w.dat"));

    fs.release(fh).await.unwrap();
    assert!(fs.getattr(&id).is_err());
    // the remote already deleted it: no delete call is issued locally
    assert_eq!(harness.fake.calls_matching("delete:W"), 0);
}

#[tokio::test]
async fn b4_local_unlink_while_open_deletes_remotely_once() {
    let fake = FakeDrive::new();
    fake.add_file("U", "u.dat", "root", b"unlink me");
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let id = ItemId::new("U");
    let fh = fs.open(&id, false, false).await.unwrap();

    fs.unlink(&fs.root_id(), "u.dat").await.unwrap();
    // the handle stays usable after the unlink
    assert_eq!(fs.read(fh, 0, 9).unwrap(), b"unlink me");
    assert_eq!(harness.fake.calls_matching("delete:U"), 0);

    fs.release(fh).await.unwrap();
    // the remote delete happened exactly once, at last close
    assert_eq!(harness.fake.calls_matching("delete:U"), 1);
    assert!(fs.getattr(&id).is_err());
}

// ============================================================================
// S5 / P4: crash resumption of a chunked session
// ============================================================================

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 251) as u8).collect()
}

#[tokio::test]
async fn s5_restart_resumes_from_persisted_offset() {
    const TOTAL: usize = 960 * 1024;
    const OFFSET: u64 = 640 * 1024;

    let fake = FakeDrive::new();
    let body = patterned(TOTAL);
    fake.add_file("BIG", "big.bin", "root", b"old remote body");
    let etag = fake.remote_etag("BIG").unwrap();
    fake.seed_session("fake://session/seeded", "BIG", &body[..OFFSET as usize]);

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.chunk_size = 320 * 1024;

    // pre-crash durable state: inode, body, and the half-done session
    let pool = DatabasePool::in_memory().await.unwrap();
    let store = MetadataStore::new(&pool);
    let cache = ContentCache::new(config.content_dir(), config.tmp_dir()).unwrap();
    let id = ItemId::new("BIG");
    cache.write_at(&id, 0, &body).unwrap();

    let mut inode = Inode::new_local_file("big.bin", ItemId::root(), FILE_MODE);
    inode.id = id.clone();
    inode.size = TOTAL as u64;
    inode.etag = Some(etag.clone());
    inode.hash = Some(QuickXorHash::digest(b"old remote body"));
    store.put_inode(&inode).await.unwrap();

    let mut session = UploadSession::new(
        id.clone(),
        ItemId::root(),
        "big.bin",
        TOTAL as u64,
        config.small_upload_cutoff,
        Some(etag),
        QuickXorHash::digest(&body),
        UploadPriority::Foreground,
    );
    session.upload_url = Some("fake://session/seeded".into());
    session.offset = OFFSET;
    session.state = UploadState::InFlight;
    store.put_upload(&session).await.unwrap();

    // "restart"
    let harness = {
        let pool_for_mount = pool;
        let fake = fake.clone();
        async move {
            let fs = cirrus_fs::Filesystem::new(
                cirrus_fs::FilesystemOptions { config },
                &pool_for_mount,
                fake.clone(),
                Arc::new(cirrus_core::ports::auth::StaticToken("t".into())),
            )
            .await
            .unwrap();
            fs.start();
            Harness {
                fs,
                fake,
                pool: pool_for_mount,
                dir,
            }
        }
    }
    .await;

    wait_until(WAIT, || {
        harness.fake.remote_body("BIG").map(|b| b.len()) == Some(TOTAL)
    })
    .await;
    assert_eq!(harness.fake.remote_body("BIG").unwrap(), body);

    // P4: nothing below the persisted offset was re-sent
    for call in harness.fake.calls() {
        if let Some(offset) = call.strip_prefix("put_chunk:") {
            assert!(offset.parse::<u64>().unwrap() >= OFFSET, "re-sent {call}");
        }
    }
    assert!(harness.fake.calls_matching("put_chunk:655360") >= 1);

    // the session record is gone and the inode adopted the final etag
    wait_for_status(&harness, &id, FileStatus::Cached).await;
    let store = MetadataStore::new(&harness.pool);
    assert!(store.get_upload(&id).await.unwrap().is_none());
    assert_eq!(
        harness.fs.getattr(&id).unwrap().etag,
        harness.fake.remote_etag("BIG")
    );
}

// ============================================================================
// B2: a session resumed at offset == total completes immediately
// ============================================================================

#[tokio::test]
async fn b2_resume_at_end_finishes_with_final_chunk() {
    const TOTAL: usize = 640 * 1024;

    let fake = FakeDrive::new();
    let body = patterned(TOTAL);
    fake.add_file("DONE", "done.bin", "root", b"old");
    let etag = fake.remote_etag("DONE").unwrap();
    fake.seed_session("fake://session/done", "DONE", &body);

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.chunk_size = 320 * 1024;

    let pool = DatabasePool::in_memory().await.unwrap();
    let store = MetadataStore::new(&pool);
    let cache = ContentCache::new(config.content_dir(), config.tmp_dir()).unwrap();
    let id = ItemId::new("DONE");
    cache.write_at(&id, 0, &body).unwrap();

    let mut inode = Inode::new_local_file("done.bin", ItemId::root(), FILE_MODE);
    inode.id = id.clone();
    inode.size = TOTAL as u64;
    inode.etag = Some(etag.clone());
    store.put_inode(&inode).await.unwrap();

    let mut session = UploadSession::new(
        id.clone(),
        ItemId::root(),
        "done.bin",
        TOTAL as u64,
        config.small_upload_cutoff,
        Some(etag),
        QuickXorHash::digest(&body),
        UploadPriority::Foreground,
    );
    session.upload_url = Some("fake://session/done".into());
    session.offset = TOTAL as u64;
    session.state = UploadState::InFlight;
    store.put_upload(&session).await.unwrap();

    let fs = cirrus_fs::Filesystem::new(
        cirrus_fs::FilesystemOptions { config },
        &pool,
        fake.clone(),
        Arc::new(cirrus_core::ports::auth::StaticToken("t".into())),
    )
    .await
    .unwrap();
    fs.start();

    let harness = Harness {
        fs,
        fake,
        pool,
        dir,
    };
    wait_for_status(&harness, &id, FileStatus::Cached).await;

    // a single zero-length final chunk yields the item
    assert_eq!(harness.fake.calls_matching("put_chunk:"), 1);
    assert_eq!(
        harness.fake.calls_matching(&format!("put_chunk:{TOTAL}")),
        1
    );
}

// ============================================================================
// S6 / R2: offline write, reconnect, drain
// ============================================================================

#[tokio::test]
async fn s6_offline_write_uploads_after_reconnect() {
    let fake = FakeDrive::new();
    let harness = mount(fake).await;
    let fs = &harness.fs;

    // go dark
    harness.fake.set_transport_failing(true);
    fs.network().record_probe(false);
    assert!(fs.network().is_offline());

    let root = fs.root_id();
    let (inode, fh) = fs.create(&root, "v.txt", FILE_MODE).await.unwrap();
    fs.write(fh, 0, b"written while offline").await.unwrap();
    fs.release(fh).await.unwrap();
    let local_hash = fs.getattr(&inode.id).unwrap().hash;

    // queued but not dispatched
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.fake.calls_matching("upload_small"), 0);
    assert_eq!(fs.getattr(&inode.id).unwrap().status, FileStatus::LocalModified);
    assert!(fs.inspect().await.unwrap().upload_queue_depth >= 1);

    // reconnect: workers drain, delta polls
    harness.fake.set_transport_failing(false);
    fs.network().record_probe(true);

    wait_until(WAIT, || harness.fake.id_by_name("v.txt").is_some()).await;
    let server_id = harness.fake.id_by_name("v.txt").unwrap();
    let id = ItemId::new(server_id.clone());
    wait_for_status(&harness, &id, FileStatus::Cached).await;

    // R2: the server hash equals the pre-upload local hash
    assert_eq!(harness.fake.remote_hash(&server_id), local_hash);
}

// ============================================================================
// B1: the small-upload cutoff boundary
// ============================================================================

#[tokio::test]
async fn b1_cutoff_selects_small_path() {
    let fake = FakeDrive::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.small_upload_cutoff = 8;
    let harness = mount_with_config(fake, config, dir).await;
    let fs = &harness.fs;

    let (_, fh) = fs.create(&fs.root_id(), "exact.bin", FILE_MODE).await.unwrap();
    fs.write(fh, 0, &[7u8; 8]).await.unwrap();
    fs.release(fh).await.unwrap();

    wait_until(WAIT, || harness.fake.id_by_name("exact.bin").is_some()).await;
    assert!(harness.fake.calls_matching("upload_small") >= 1);
    assert_eq!(harness.fake.calls_matching("create_session"), 0);
}

#[tokio::test]
async fn b1_cutoff_plus_one_selects_session_path() {
    let fake = FakeDrive::new();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.small_upload_cutoff = 8;
    let harness = mount_with_config(fake, config, dir).await;
    let fs = &harness.fs;

    let (_, fh) = fs.create(&fs.root_id(), "over.bin", FILE_MODE).await.unwrap();
    fs.write(fh, 0, &[7u8; 9]).await.unwrap();
    fs.release(fh).await.unwrap();

    wait_until(WAIT, || harness.fake.id_by_name("over.bin").is_some()).await;
    assert_eq!(harness.fake.calls_matching("upload_small"), 0);
    assert_eq!(harness.fake.calls_matching("create_session"), 1);
}

// ============================================================================
// B3: 304 Not Modified leaves the cached body untouched
// ============================================================================

#[tokio::test]
async fn b3_not_modified_marks_cached_without_bytes() {
    let fake = FakeDrive::new();
    let body = b"already local".to_vec();
    fake.add_file("C3", "c3.txt", "root", &body);
    let etag = fake.remote_etag("C3").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    // durable state from a previous run: metadata Cloud, body present
    let pool = DatabasePool::in_memory().await.unwrap();
    let store = MetadataStore::new(&pool);
    let cache = ContentCache::new(config.content_dir(), config.tmp_dir()).unwrap();
    let id = ItemId::new("C3");
    cache.write_at(&id, 0, &body).unwrap();

    let mut inode = Inode::new_local_file("c3.txt", ItemId::root(), FILE_MODE);
    inode.id = id.clone();
    inode.size = body.len() as u64;
    inode.etag = Some(etag);
    inode.hash = Some(QuickXorHash::digest(&body));
    inode.flags.has_changes = false;
    inode.status = FileStatus::Cloud;
    store.put_inode(&inode).await.unwrap();

    let fs = cirrus_fs::Filesystem::new(
        cirrus_fs::FilesystemOptions { config },
        &pool,
        fake.clone(),
        Arc::new(cirrus_core::ports::auth::StaticToken("t".into())),
    )
    .await
    .unwrap();
    fs.start();
    let harness = Harness {
        fs,
        fake,
        pool,
        dir,
    };
    let fs = &harness.fs;

    let fh = fs.open(&id, false, false).await.unwrap();
    assert_eq!(fs.getattr(&id).unwrap().status, FileStatus::Cached);
    assert_eq!(fs.read(fh, 0, body.len() as u32).unwrap(), body);
    fs.release(fh).await.unwrap();

    assert_eq!(harness.fake.calls_matching("download:C3:304"), 1);
    assert_eq!(harness.fake.calls_matching("download:C3:200"), 0);
}

// ============================================================================
// R3: re-applying an already-applied delta page is a no-op
// ============================================================================

#[tokio::test]
async fn r3_delta_replay_is_idempotent() {
    let fake = FakeDrive::new();
    fake.add_folder("DIR", "Documents", "root");
    fake.add_file("F1", "a.txt", "DIR", b"alpha");
    fake.add_file("F2", "b.txt", "DIR", b"beta");
    let harness = mount(fake).await;
    let fs = &harness.fs;

    // hydrate one file so statuses are mixed
    let fh = fs.open(&ItemId::new("F1"), false, false).await.unwrap();
    fs.release(fh).await.unwrap();

    let snapshot = |children: Vec<Inode>| {
        let mut names: Vec<(String, FileStatus)> = children
            .into_iter()
            .map(|c| (c.name, c.status))
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));
        names
    };
    let before = snapshot(fs.readdir(&ItemId::new("DIR")).await.unwrap());
    let f1_before = fs.getattr(&ItemId::new("F1")).unwrap();

    // rewind the cursor and replay the whole feed
    let store = MetadataStore::new(&harness.pool);
    store.put_delta_cursor("testdrive", "0").await.unwrap();
    fs.delta().poll_once().await.unwrap();

    let after = snapshot(fs.readdir(&ItemId::new("DIR")).await.unwrap());
    assert_eq!(before, after);

    let f1_after = fs.getattr(&ItemId::new("F1")).unwrap();
    assert_eq!(f1_before.status, f1_after.status);
    assert_eq!(f1_before.etag, f1_after.etag);
    // the hydrated body survived the replay
    assert_eq!(f1_after.status, FileStatus::Cached);
}

// ============================================================================
// R4: rename there and back restores identity
// ============================================================================

#[tokio::test]
async fn r4_rename_roundtrip_restores_identity() {
    let fake = FakeDrive::new();
    fake.add_file("RN", "a.txt", "root", b"name games");
    let harness = mount(fake).await;
    let fs = &harness.fs;
    let root = fs.root_id();

    fs.rename(&root, "a.txt", &root, "b.txt").await.unwrap();
    assert!(fs.lookup(&root, "b.txt").await.is_ok());
    assert!(fs.lookup(&root, "a.txt").await.is_err());

    fs.rename(&root, "b.txt", &root, "a.txt").await.unwrap();
    let record = fs.lookup(&root, "a.txt").await.unwrap();
    assert_eq!(record.id.as_str(), "RN");
    assert_eq!(record.name, "a.txt");
    assert_eq!(record.parent.unwrap(), root);

    assert_eq!(harness.fake.calls_matching("patch:RN"), 2);
}

// ============================================================================
// P7: at-most-one download per id under racing openers
// ============================================================================

#[tokio::test]
async fn p7_concurrent_openers_share_one_download() {
    let fake = FakeDrive::new();
    fake.add_file("P7", "p7.bin", "root", &patterned(64 * 1024));
    let harness = mount(fake).await;
    let fs = Arc::clone(&harness.fs);

    let id = ItemId::new("P7");
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let fs = Arc::clone(&fs);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            let fh = fs.open(&id, false, false).await.unwrap();
            let bytes = fs.read(fh, 0, 64 * 1024).unwrap();
            fs.release(fh).await.unwrap();
            bytes.len()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 64 * 1024);
    }

    assert_eq!(harness.fake.calls_matching("download:P7"), 1);
    assert_eq!(harness.fake.max_concurrent_downloads(), 1);
}

// ============================================================================
// mkdir, fsync, eviction
// ============================================================================

#[tokio::test]
async fn mkdir_is_a_direct_remote_call() {
    let fake = FakeDrive::new();
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let folder = fs.mkdir(&fs.root_id(), "Projects").await.unwrap();
    assert!(!folder.id.is_local());
    assert!(folder.is_dir());
    assert_eq!(harness.fake.calls_matching("create_folder:Projects"), 1);

    let listed = fs.readdir(&fs.root_id()).await.unwrap();
    assert!(listed.iter().any(|c| c.name == "Projects"));
}

#[tokio::test]
async fn fsync_waits_for_the_interactive_upload() {
    let fake = FakeDrive::new();
    let harness = mount(fake).await;
    let fs = &harness.fs;

    let (_, fh) = fs.create(&fs.root_id(), "sync.txt", FILE_MODE).await.unwrap();
    fs.write(fh, 0, b"durable now").await.unwrap();
    fs.fsync(fh).await.unwrap();

    // by the time fsync returns the bytes are on the server
    let server_id = harness.fake.id_by_name("sync.txt").unwrap();
    assert_eq!(harness.fake.remote_body(&server_id).unwrap(), b"durable now");

    // the close afterwards has nothing left to upload
    fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn eviction_removes_lru_clean_bodies_only() {
    let fake = FakeDrive::new();
    fake.add_file("E1", "old.bin", "root", &[1u8; 80]);
    fake.add_file("E2", "new.bin", "root", &[2u8; 80]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.cache_max_bytes = 100;
    let harness = mount_with_config(fake, config, dir).await;
    let fs = &harness.fs;

    for id in ["E1", "E2"] {
        let fh = fs.open(&ItemId::new(id), false, false).await.unwrap();
        fs.release(fh).await.unwrap();
    }
    assert_eq!(fs.getattr(&ItemId::new("E1")).unwrap().status, FileStatus::Cached);

    fs.maintain_cache().await;

    // the least recently used body went back to ghost state
    assert_eq!(fs.getattr(&ItemId::new("E1")).unwrap().status, FileStatus::Cloud);
    assert_eq!(fs.getattr(&ItemId::new("E2")).unwrap().status, FileStatus::Cached);
}

#[tokio::test]
async fn pinned_and_dirty_bodies_are_never_evicted() {
    let fake = FakeDrive::new();
    fake.add_file("PIN", "pinned.bin", "root", &[1u8; 80]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.cache_max_bytes = 50;
    let harness = mount_with_config(fake, config, dir).await;
    let fs = &harness.fs;

    let id = ItemId::new("PIN");
    let fh = fs.open(&id, false, false).await.unwrap();
    fs.release(fh).await.unwrap();
    fs.set_pinned(&id, true).await.unwrap();

    fs.maintain_cache().await;
    // over capacity, but the pin protects the body
    assert_eq!(fs.getattr(&id).unwrap().status, FileStatus::Cached);
}

// ============================================================================
// xattr surface
// ============================================================================

#[tokio::test]
async fn xattr_exposes_status_and_controls() {
    let fake = FakeDrive::new();
    fake.add_file("XA", "attrs.txt", "root", b"xattrs");
    let harness = mount(fake).await;
    let fs = &harness.fs;
    let id = ItemId::new("XA");

    assert_eq!(
        fs.getxattr(&id, "user.cirrusfs.status").unwrap(),
        b"cloud".to_vec()
    );
    assert_eq!(fs.getxattr(&id, "user.cirrusfs.pin").unwrap(), b"0".to_vec());

    fs.setxattr(&id, "user.cirrusfs.pin", b"1").await.unwrap();
    assert_eq!(fs.getxattr(&id, "user.cirrusfs.pin").unwrap(), b"1".to_vec());

    // the status attribute is not writable
    assert!(fs.setxattr(&id, "user.cirrusfs.status", b"cached").await.is_err());
    assert!(fs.listxattr().contains(&"user.cirrusfs.status"));
}
