// tests/properties.rs
//
// End-to-end behaviour of a mounted file system on the in-memory
// coordinator and a local directory backend.
use async_trait::async_trait;
use coordfs::cadapter::{
    BackendAddr, BackendError, LocalFsBackend, ObjectMeta, ObjectStream, PutResponse,
    StorageBackend,
};
use coordfs::config::{Container, ContainerKind, CoordinationConfig, FsSettings, TmpConfig};
use coordfs::coord::{CoordinationClient, LockManager, MemoryCoordinator};
use coordfs::meta::{FileState, Inode, InodeType};
use coordfs::vfs::{ConnectionState, FsEvent, VirtualFileSystem};
use coordfs::FsError;
use log::info;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;

static INIT: Once = Once::new();

fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .target(env_logger::Target::Stdout)
            .is_test(true)
            .init();
    });
}

fn settings(root: &Path, id: &str) -> FsSettings {
    FsSettings {
        name: "props".to_string(),
        id: id.to_string(),
        coordination: CoordinationConfig {
            lock_timeout_ms: 2_000,
            ..CoordinationConfig::default()
        },
        tmp: TmpConfig {
            path: root.join(format!("tmp-{id}")),
            ttl_ms: 60_000,
            clean: false,
        },
        upload_threads: 2,
        download_timeout_ms: 500,
        containers: vec![Container {
            domain: "docs".to_string(),
            kind: ContainerKind::Local {
                root: root.join("store"),
            },
        }],
    }
}

async fn mount(root: &Path, id: &str, client: Arc<MemoryCoordinator>) -> VirtualFileSystem {
    VirtualFileSystem::mount(settings(root, id), client)
        .await
        .unwrap()
}

/// Local backend whose writes and deletes can be made to fail and whose
/// reads can be slowed down.
struct FlakyBackend {
    inner: LocalFsBackend,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    get_delay_ms: AtomicU64,
    gets: AtomicU64,
}

impl FlakyBackend {
    fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalFsBackend::new(root),
            fail_put: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            get_delay_ms: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn exists(&self, addr: &BackendAddr) -> Result<bool, BackendError> {
        self.inner.exists(addr).await
    }

    async fn head(&self, addr: &BackendAddr) -> Result<ObjectMeta, BackendError> {
        self.inner.head(addr).await
    }

    async fn get(&self, addr: &BackendAddr) -> Result<ObjectStream, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.get(addr).await
    }

    async fn put(&self, addr: &BackendAddr, source: &Path) -> Result<PutResponse, BackendError> {
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(BackendError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put(addr, source).await
    }

    async fn delete(&self, addr: &BackendAddr, recursive: bool) -> Result<bool, BackendError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(BackendError::Io(std::io::Error::other("permission denied")));
        }
        self.inner.delete(addr, recursive).await
    }
}

async fn mount_flaky(
    root: &Path,
    client: Arc<MemoryCoordinator>,
) -> (VirtualFileSystem, Arc<FlakyBackend>) {
    let backend = FlakyBackend::new(root.join("store"));
    let mut backends: HashMap<String, Arc<dyn StorageBackend>> = HashMap::new();
    backends.insert("docs".to_string(), backend.clone());
    let fs = VirtualFileSystem::mount_with_backends(settings(root, "x"), client, backends)
        .await
        .unwrap();
    (fs, backend)
}

async fn write_file(fs: &VirtualFileSystem, path: &str, bytes: &[u8]) -> Inode {
    let mut writer = fs.writer("docs", path, true).await.unwrap();
    writer.write(bytes).await.unwrap();
    writer.commit(true).await.unwrap().wait().await.unwrap()
}

async fn next_event(rx: &mut broadcast::Receiver<FsEvent>) -> FsEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .unwrap()
}

#[tokio::test]
async fn bootstrap_is_idempotent_across_process_starts() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryCoordinator::new());

    let first = mount(tmp.path(), "x", client.clone()).await;
    let root_a = first.get("docs", "/").await.unwrap().unwrap();
    first.close().await;

    let second = mount(tmp.path(), "y", client.clone()).await;
    let root_b = second.get("docs", "/").await.unwrap().unwrap();
    assert_eq!(root_a.uuid, root_b.uuid);
    assert!(root_b.is_root());
    assert_eq!(second.domains(), vec!["docs"]);
    info!("domain root {} survived a remount", root_b.uuid);
}

#[tokio::test]
async fn stale_copy_is_rejected_fresh_copy_accepted() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    fs.create("docs", "/notes.txt").await.unwrap();

    let t0 = fs.get("docs", "/notes.txt").await.unwrap().unwrap();
    let concurrent = fs.get("docs", "/notes.txt").await.unwrap().unwrap();
    let persisted = fs.update(concurrent).await.unwrap();
    assert!(persisted.update_timestamp > t0.update_timestamp);

    let err = fs.update(t0).await.unwrap_err();
    assert!(matches!(err, FsError::StaleInode { .. }), "got {err:?}");

    let fresh = fs.get("docs", "/notes.txt").await.unwrap().unwrap();
    let updated = fs.update(fresh).await.unwrap();
    assert!(updated.update_timestamp > persisted.update_timestamp);
}

#[tokio::test]
async fn content_lock_is_exclusive_and_reentrant() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryCoordinator::new());
    let x = mount(tmp.path(), "x", client.clone()).await;
    let y = mount(tmp.path(), "y", client).await;
    let file = x.create("docs", "/shared.bin").await.unwrap();

    let locked = x.file_lock(file).await.unwrap();
    let first = locked.lock().unwrap().time_updated;

    let seen_by_y = y.get("docs", "/shared.bin").await.unwrap().unwrap();
    let err = y.file_lock(seen_by_y.clone()).await.unwrap_err();
    assert!(matches!(err, FsError::FileAlreadyLocked { ref owner_id } if owner_id == "x"));
    let err = y.file_unlock(seen_by_y).await.unwrap_err();
    assert!(matches!(err, FsError::NotLocked { .. }));

    let again = x.file_lock(locked).await.unwrap();
    assert!(again.lock().unwrap().time_updated > first);
    assert!(x.is_file_locked(&again).await.unwrap());
    assert!(!y.is_file_locked(&again).await.unwrap());

    let released = x.file_unlock(again).await.unwrap();
    assert!(released.lock().is_none());
    assert!(y.file_lock(released).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sibling_paths_are_created_concurrently() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryCoordinator::new());
    let x = mount(tmp.path(), "x", client.clone()).await;
    let y = mount(tmp.path(), "y", client).await;

    let (c, e) = tokio::join!(x.mkdir("docs", "/a/b/c"), y.mkdir("docs", "/a/d/e"));
    let c = c.unwrap();
    let e = e.unwrap();
    assert!(c.zk_path.ends_with("/docs/a/b/c"));
    assert!(e.zk_path.ends_with("/docs/a/d/e"));

    let children: Vec<String> = x
        .list("docs", "/a", false)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.name)
        .collect();
    assert_eq!(children, vec!["b", "d"]);

    // both leaves hang under the same /a
    let a = x.get("docs", "/a").await.unwrap().unwrap();
    let b = x.get("docs", "/a/b").await.unwrap().unwrap();
    let d = y.get("docs", "/a/d").await.unwrap().unwrap();
    assert_eq!(b.parent.as_deref(), Some(a.zk_path.as_str()));
    assert_eq!(d.parent.as_deref(), Some(a.zk_path.as_str()));
}

#[tokio::test]
async fn create_is_exclusive_and_type_checked() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;

    let file = fs.create("docs", "/dir/file.txt").await.unwrap();
    assert_eq!(file.state(), Some(FileState::New));
    assert!(fs.get("docs", "/dir").await.unwrap().unwrap().is_directory());

    let err = fs.create("docs", "/dir/file.txt").await.unwrap_err();
    assert!(matches!(err, FsError::PathConflict { .. }));
    let err = fs.mkdir("docs", "/dir/file.txt").await.unwrap_err();
    assert!(matches!(err, FsError::PathConflict { .. }));
    let err = fs.create("docs", "/dir/file.txt/child").await.unwrap_err();
    assert!(matches!(err, FsError::PathConflict { .. }));

    // mkdir is idempotent
    let dir = fs.mkdir("docs", "/dir").await.unwrap();
    assert_eq!(dir.uuid, fs.mkdir("docs", "/dir").await.unwrap().uuid);

    let archive = fs.create_archive("docs", "/dir/bundle.tar").await.unwrap();
    assert_eq!(archive.inode_type(), InodeType::Archive);

    let err = fs.mkdir("media", "/x").await.unwrap_err();
    assert!(matches!(err, FsError::DomainNotRegistered(d) if d == "media"));
}

#[tokio::test]
async fn committed_write_syncs_and_clears_lock() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    let mut events = fs.subscribe();

    let created = fs.create("docs", "/report.txt").await.unwrap();
    assert_eq!(created.state(), Some(FileState::New));

    let mut writer = fs.writer("docs", "/report.txt", true).await.unwrap();
    assert!(writer.staging_path().starts_with(fs.temp().root()));
    writer.write(b"hello ").await.unwrap();
    writer.write(b"world").await.unwrap();
    assert_eq!(writer.written(), 11);

    let pending = writer.commit(true).await.unwrap();
    assert_eq!(pending.inode().state(), Some(FileState::PendingSync));
    assert!(pending.inode().file_info().unwrap().tmp_path.is_some());

    let synced = pending.wait().await.unwrap();
    let info = synced.file_info().unwrap();
    assert_eq!(info.state, FileState::Synced);
    assert!(info.lock.is_none());
    assert!(info.tmp_path.is_none());
    assert_eq!(info.synced_size, 11);
    assert!(synced.sync_timestamp > created.sync_timestamp);

    let stored = fs.get("docs", "/report.txt").await.unwrap().unwrap();
    assert_eq!(stored.state(), Some(FileState::Synced));
    assert!(fs.exists("docs", "/report.txt").await.unwrap());
    assert_eq!(fs.size(&stored).await.unwrap(), 11);
    let on_disk = tmp.path().join("store/docs/report.txt");
    assert_eq!(std::fs::read(on_disk).unwrap(), b"hello world");

    match next_event(&mut events).await {
        FsEvent::UploadSucceeded { path, size, .. } => {
            assert_eq!(path, "/report.txt");
            assert_eq!(size, 11);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let mut reader = fs.reader("docs", "/report.txt").await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), b"hello world");
}

#[tokio::test]
async fn failed_upload_marks_error_and_keeps_lock() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let (fs, backend) = mount_flaky(tmp.path(), Arc::new(MemoryCoordinator::new())).await;
    let mut events = fs.subscribe();
    backend.fail_put.store(true, Ordering::SeqCst);

    let mut writer = fs.writer("docs", "/broken.bin", true).await.unwrap();
    writer.write(b"payload").await.unwrap();
    let err = writer.commit(true).await.unwrap().wait().await.unwrap_err();
    assert!(matches!(err, FsError::BackendIo(_)), "got {err:?}");

    let stored = fs.get("docs", "/broken.bin").await.unwrap().unwrap();
    assert_eq!(stored.state(), Some(FileState::Error));
    assert_eq!(stored.lock().unwrap().client_id, "x");
    // Error is not "locked for update"
    assert!(!fs.is_file_locked(&stored).await.unwrap());

    match next_event(&mut events).await {
        FsEvent::UploadFailed { path, error, .. } => {
            assert_eq!(path, "/broken.bin");
            assert!(error.contains("disk full"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    // the owner can retry once the backend recovers
    backend.fail_put.store(false, Ordering::SeqCst);
    let retried = write_file(&fs, "/broken.bin", b"payload").await;
    assert_eq!(retried.state(), Some(FileState::Synced));
    assert!(retried.lock().is_none());
}

#[tokio::test]
async fn never_synced_file_reads_empty_after_failed_upload() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryCoordinator::new());
    let (x, backend) = mount_flaky(tmp.path(), client.clone()).await;
    let y = mount(tmp.path(), "y", client).await;
    backend.fail_put.store(true, Ordering::SeqCst);

    let mut writer = x.writer("docs", "/first.bin", true).await.unwrap();
    writer.write(b"never lands").await.unwrap();
    writer.commit(true).await.unwrap().wait().await.unwrap_err();

    let stored = x.get("docs", "/first.bin").await.unwrap().unwrap();
    assert_eq!(stored.state(), Some(FileState::Error));
    assert_eq!(stored.sync_timestamp, 0);

    let mut own = x.reader("docs", "/first.bin").await.unwrap();
    assert!(own.read_to_end().await.unwrap().is_empty());
    let mut foreign = y.reader("docs", "/first.bin").await.unwrap();
    assert!(foreign.read_to_end().await.unwrap().is_empty());

    x.close().await;
    y.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_downloads_share_one_complete_copy() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let (fs, backend) = mount_flaky(tmp.path(), Arc::new(MemoryCoordinator::new())).await;
    write_file(&fs, "/slow.txt", b"hello world").await;
    backend.gets.store(0, Ordering::SeqCst);
    backend.get_delay_ms.store(300, Ordering::SeqCst);

    // the second reader starts while the first is still streaming
    let (first, second) = tokio::join!(fs.reader("docs", "/slow.txt"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs.reader("docs", "/slow.txt").await
    });
    let (mut first, mut second) = (first.unwrap(), second.unwrap());
    assert_eq!(second.read_to_end().await.unwrap(), b"hello world");
    assert_eq!(first.read_to_end().await.unwrap(), b"hello world");
    assert_eq!(first.local_path(), second.local_path());
    assert_eq!(backend.gets.load(Ordering::SeqCst), 1);

    assert_eq!(
        tokio::fs::read(first.local_path()).await.unwrap(),
        b"hello world"
    );
    let leftovers: Vec<_> = std::fs::read_dir(first.local_path().parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
        .collect();
    assert!(leftovers.is_empty());
    fs.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_see_full_content() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    write_file(&fs, "/shared.bin", &payload).await;

    let reads = futures::future::join_all((0..8).map(|_| async {
        let mut reader = fs.reader("docs", "/shared.bin").await.unwrap();
        reader.read_to_end().await.unwrap()
    }))
    .await;
    for read in reads {
        assert_eq!(read, payload);
    }
    fs.close().await;
}

#[tokio::test]
async fn retained_lock_leaves_file_updating() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;

    let mut writer = fs.writer("docs", "/chunked.log", true).await.unwrap();
    writer.write(b"part-1;").await.unwrap();
    writer.heartbeat().await.unwrap();
    let partial = writer.commit(false).await.unwrap().wait().await.unwrap();
    assert_eq!(partial.state(), Some(FileState::Updating));
    assert_eq!(partial.lock().unwrap().client_id, "x");
    assert!(fs.is_file_locked(&partial).await.unwrap());

    // same client resumes and appends to the staged bytes
    let mut writer = fs.writer("docs", "/chunked.log", false).await.unwrap();
    writer.write(b"part-2").await.unwrap();
    let done = writer.commit(true).await.unwrap().wait().await.unwrap();
    assert_eq!(done.state(), Some(FileState::Synced));

    let mut reader = fs.reader("docs", "/chunked.log").await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), b"part-1;part-2");
}

#[tokio::test]
async fn appending_writer_starts_from_backend_content() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    write_file(&fs, "/append.txt", b"abc").await;

    let mut writer = fs.writer("docs", "/append.txt", false).await.unwrap();
    writer.write(b"def").await.unwrap();
    assert_eq!(writer.written(), 3);
    writer.commit(true).await.unwrap().wait().await.unwrap();

    let mut reader = fs.reader("docs", "/append.txt").await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), b"abcdef");
}

#[tokio::test]
async fn aborted_writer_releases_lock_and_staging() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;

    let mut writer = fs.writer("docs", "/draft.md", true).await.unwrap();
    writer.write(b"scratch").await.unwrap();
    let staging = writer.staging_path().to_path_buf();
    let released = writer.abort().await.unwrap();
    assert!(released.lock().is_none());
    assert!(!staging.exists());
    assert_eq!(released.state(), Some(FileState::New));
    assert!(!fs.exists("docs", "/draft.md").await.unwrap());
}

#[tokio::test]
async fn download_waits_for_foreign_writer() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let client = Arc::new(MemoryCoordinator::new());
    let x = mount(tmp.path(), "x", client.clone()).await;
    let y = mount(tmp.path(), "y", client).await;

    // y uploads a first chunk and keeps the file locked for update
    let mut writer = y.writer("docs", "/busy.txt", true).await.unwrap();
    writer.write(b"v1").await.unwrap();
    let partial = writer.commit(false).await.unwrap().wait().await.unwrap();
    assert_eq!(partial.state(), Some(FileState::Updating));

    let inode = x.get("docs", "/busy.txt").await.unwrap().unwrap();
    let err = x
        .download(&inode, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Unavailable { timeout_ms: 200, .. }));

    let writer = y.writer("docs", "/busy.txt", false).await.unwrap();
    writer.commit(true).await.unwrap().wait().await.unwrap();
    let local = x.download(&inode, Duration::from_millis(200)).await.unwrap();
    assert_eq!(std::fs::read(local).unwrap(), b"v1");
}

#[tokio::test]
async fn download_cache_follows_sync_timestamp() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;

    let v1 = write_file(&fs, "/cached.txt", b"v1").await;
    let first = fs.download(&v1, Duration::from_secs(1)).await.unwrap();
    let again = fs.download(&v1, Duration::from_secs(1)).await.unwrap();
    assert_eq!(first, again);

    let v2 = write_file(&fs, "/cached.txt", b"version-2").await;
    assert!(v2.sync_timestamp > v1.sync_timestamp);
    let second = fs.download(&v2, Duration::from_secs(1)).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(std::fs::read(&second).unwrap(), b"version-2");

    // a never-uploaded file reads as empty
    let empty = fs.create("docs", "/empty.txt").await.unwrap();
    let mut reader = fs.reader("docs", "/empty.txt").await.unwrap();
    assert_eq!(reader.inode().uuid, empty.uuid);
    assert!(reader.read_to_end().await.unwrap().is_empty());
}

#[tokio::test]
async fn eviction_removes_only_expired_temp_files() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;

    let old = fs
        .temp()
        .create_tmp_file(Some("docs"), Some("old.part"))
        .await
        .unwrap();
    let young = fs.temp().create_tmp_file(None, None).await.unwrap();
    std::fs::File::options()
        .write(true)
        .open(&old)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    let removed = fs.temp().sweep(Duration::from_secs(60)).await.unwrap();
    assert_eq!(removed, 1);
    assert!(!old.exists());
    assert!(young.exists());
}

#[tokio::test]
async fn recursive_delete_removes_descendants_but_never_root() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    fs.mkdir("docs", "/d/e").await.unwrap();
    write_file(&fs, "/d/e/f.txt", b"f").await;
    write_file(&fs, "/d/g.txt", b"g").await;
    write_file(&fs, "/keep.txt", b"k").await;

    let err = fs.delete("docs", "/d", false).await.unwrap_err();
    assert!(matches!(err, FsError::PathConflict { .. }));

    assert!(fs.delete("docs", "/d", true).await.unwrap());
    let left: Vec<String> = fs
        .list("docs", "/", true)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.absolute_path)
        .collect();
    assert_eq!(left, vec!["/keep.txt"]);
    assert!(fs.get("docs", "/d/e/f.txt").await.unwrap().is_none());
    assert!(!tmp.path().join("store/docs/d").exists());

    assert!(!fs.delete("docs", "/d", true).await.unwrap());
    for recursive in [true, false] {
        let err = fs.delete("docs", "/", recursive).await.unwrap_err();
        assert!(matches!(err, FsError::RootNotDeletable { ref domain } if domain == "docs"));
    }
}

#[tokio::test]
async fn failed_backend_delete_emits_orphan_event() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let (fs, backend) = mount_flaky(tmp.path(), Arc::new(MemoryCoordinator::new())).await;
    write_file(&fs, "/orphan.bin", b"bytes").await;
    let mut events = fs.subscribe();
    backend.fail_delete.store(true, Ordering::SeqCst);

    assert!(fs.delete("docs", "/orphan.bin", false).await.unwrap());
    assert!(fs.get("docs", "/orphan.bin").await.unwrap().is_none());
    assert!(tmp.path().join("store/docs/orphan.bin").exists());

    match next_event(&mut events).await {
        FsEvent::Orphaned { path, addr, .. } => {
            assert_eq!(path, "/orphan.bin");
            assert!(addr.starts_with("file://"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn find_matches_file_and_parent_patterns() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    for path in ["/logs/2024/a.csv", "/logs/2024/b.txt", "/data/c.csv", "/d.csv"] {
        fs.create("docs", path).await.unwrap();
    }
    fs.create_archive("docs", "/data/bundle.csv").await.unwrap();
    fs.mkdir("docs", "/dir.csv").await.unwrap();

    let mut all: Vec<String> = fs
        .find("docs", "/", None, r".*\.csv")
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.absolute_path)
        .collect();
    all.sort();
    assert_eq!(all, vec!["/d.csv", "/data/c.csv", "/logs/2024/a.csv"]);

    let logs = fs
        .find("docs", "/", Some(r"/logs/\d{4}"), r".*\.csv")
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].absolute_path, "/logs/2024/a.csv");

    let top = fs.find("docs", "/", Some("/"), ".*").await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].name, "d.csv");

    // archives and directories are never returned
    let data = fs.find("docs", "/data", None, ".*").await.unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].name, "c.csv");
    assert!(data.iter().all(|i| i.is_file()));

    // full match only
    assert!(fs.find("docs", "/", None, "csv").await.unwrap().is_empty());
    let err = fs.find("docs", "/", None, "[").await.unwrap_err();
    assert!(matches!(err, FsError::InvalidPattern(_)));
}

#[tokio::test]
async fn stored_record_round_trips() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let fs = mount(tmp.path(), "x", Arc::new(MemoryCoordinator::new())).await;
    let file = fs.create("docs", "/rt.json").await.unwrap();
    let locked = fs.file_lock(file).await.unwrap();

    let bytes = locked.encode().unwrap();
    let decoded = Inode::decode(&bytes).unwrap();
    assert_eq!(decoded, locked);
    assert_eq!(decoded.encode().unwrap(), bytes);

    let info = fs.path_info(&locked).unwrap();
    assert_eq!(info.domain, "docs");
    assert_eq!(info.path, "/rt.json");
}

#[tokio::test]
async fn structural_locks_time_out_and_require_existing_paths() {
    init_logging();
    let client = Arc::new(MemoryCoordinator::new());
    client.create_recursive("/coordfs/locks/node").await.unwrap();
    let locks = LockManager::new(client, "/coordfs/locks", Duration::from_millis(100));

    let held = locks.acquire("/coordfs/locks/node").await.unwrap();
    let err = locks
        .acquire_with_timeout("/coordfs/locks/node", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::LockTimeout { timeout_ms: 50, .. }));
    held.release().await.unwrap();
    locks
        .acquire("/coordfs/locks/node")
        .await
        .unwrap()
        .release()
        .await
        .unwrap();

    let err = locks.acquire("/coordfs/locks/missing").await.unwrap_err();
    assert!(matches!(err, FsError::PathNotFound(_)));
}

#[tokio::test]
async fn operations_fail_after_close() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), "x");
    cfg.tmp.clean = true;
    let fs = VirtualFileSystem::mount(cfg, Arc::new(MemoryCoordinator::new()))
        .await
        .unwrap();
    assert_eq!(fs.state(), ConnectionState::Connected);
    let file = fs.create("docs", "/late.txt").await.unwrap();

    fs.close().await;
    assert_eq!(fs.state(), ConnectionState::Closed);
    assert!(matches!(
        fs.get("docs", "/late.txt").await,
        Err(FsError::NotConnected { .. })
    ));
    assert!(matches!(
        fs.file_lock(file).await,
        Err(FsError::NotConnected { .. })
    ));
    assert!(matches!(
        fs.writer("docs", "/late.txt", true).await,
        Err(FsError::NotConnected { .. })
    ));
    // closing twice is harmless
    fs.close().await;
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = settings(tmp.path(), "x");
    cfg.containers.push(cfg.containers[0].clone());
    let err = VirtualFileSystem::mount(cfg, Arc::new(MemoryCoordinator::new()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FsError::Config(ref m) if m.contains("configured twice")));
}
