//! The mounted file system: one instance per process and file-system name.
//!
//! Every operation is domain-qualified and goes through the inode store for
//! metadata and the domain's backend for content. Reads never take a
//! structural lock; writes go through content locks and the upload pool.

use super::cache::DownloadCache;
use super::io::{Reader, Writer};
use super::state::{ConnectionState, FsEvent, FsState};
use super::tmp::TempStore;
use crate::cadapter::{
    BackendError, PathInfo, PathResolver, StorageBackend, connect_backend, resolver_for,
};
use crate::config::FsSettings;
use crate::coord::{CoordinationClient, LockManager};
use crate::daemon::{SyncCallbacks, UploadHandle, UploadPipeline, UploadRequest, spawn_evictor};
use crate::error::{FsError, Result};
use crate::meta::{ContentLocks, Inode, InodeStore, InodeType};
use log::{debug, info, warn};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;
const DOWNLOAD_CACHE_CAPACITY: u64 = 4096;
const AVAILABILITY_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct DomainMount {
    backend: Arc<dyn StorageBackend>,
    resolver: Arc<dyn PathResolver>,
}

pub struct VirtualFileSystem {
    settings: FsSettings,
    store: Arc<InodeStore>,
    content: ContentLocks,
    temp: Arc<TempStore>,
    uploads: UploadPipeline,
    mounts: HashMap<String, DomainMount>,
    cache: DownloadCache,
    state: Arc<FsState>,
    events: broadcast::Sender<FsEvent>,
    cancel: CancellationToken,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualFileSystem {
    /// Connects every configured container and mounts the file system.
    pub async fn mount(settings: FsSettings, client: Arc<dyn CoordinationClient>) -> Result<Self> {
        Self::mount_with_backends(settings, client, HashMap::new()).await
    }

    /// Like [`VirtualFileSystem::mount`], but domains present in `backends`
    /// use the given driver instead of connecting their container.
    pub async fn mount_with_backends(
        settings: FsSettings,
        client: Arc<dyn CoordinationClient>,
        mut backends: HashMap<String, Arc<dyn StorageBackend>>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| FsError::Config(format!("{e:#}")))?;

        let mut mounts = HashMap::new();
        let mut domains: Vec<(String, Arc<dyn PathResolver>)> = Vec::new();
        for container in &settings.containers {
            let mount = match backends.remove(&container.domain) {
                Some(backend) => DomainMount {
                    backend,
                    resolver: resolver_for(container),
                },
                None => {
                    let (backend, resolver) = connect_backend(container).await?;
                    DomainMount { backend, resolver }
                }
            };
            debug!(
                "domain {} served by {} backend",
                container.domain,
                mount.backend.name()
            );
            domains.push((container.domain.clone(), mount.resolver.clone()));
            mounts.insert(container.domain.clone(), mount);
        }

        let temp = Arc::new(TempStore::open(settings.temp_root()).await?);
        let locks = LockManager::new(client.clone(), settings.base_path(), settings.lock_timeout());
        let store = Arc::new(InodeStore::new(client, locks));
        store.bootstrap(&domains).await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let content = ContentLocks::new(
            store.clone(),
            temp.clone(),
            settings.id.clone(),
            settings.name.clone(),
        );
        let callbacks = Arc::new(SyncCallbacks::new(
            store.clone(),
            settings.id.clone(),
            events.clone(),
        ));
        let uploads = UploadPipeline::start(settings.upload_threads, callbacks);

        let state = Arc::new(FsState::new());
        state.set(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let evictor = settings.tmp.clean.then(|| {
            spawn_evictor(
                temp.clone(),
                settings.tmp_ttl(),
                state.clone(),
                events.clone(),
                cancel.clone(),
            )
        });

        info!(
            "mounted {} as client {} (domains: {:?}, temp: {})",
            settings.name,
            settings.id,
            settings.domains(),
            temp.root().display()
        );
        Ok(Self {
            settings,
            store,
            content,
            temp,
            uploads,
            mounts,
            cache: DownloadCache::new(DOWNLOAD_CACHE_CAPACITY),
            state,
            events,
            cancel,
            evictor: Mutex::new(evictor),
        })
    }

    fn mount_for(&self, domain: &str) -> Result<&DomainMount> {
        self.mounts
            .get(domain)
            .ok_or_else(|| FsError::DomainNotRegistered(domain.to_string()))
    }

    pub fn settings(&self) -> &FsSettings {
        &self.settings
    }

    pub fn client_id(&self) -> &str {
        &self.settings.id
    }

    pub fn domains(&self) -> Vec<String> {
        self.store.domains()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.events.subscribe()
    }

    pub fn temp(&self) -> &TempStore {
        &self.temp
    }

    pub async fn mkdir(&self, domain: &str, path: &str) -> Result<Inode> {
        self.state.check()?;
        let mount = self.mount_for(domain)?;
        self.store
            .create_path(domain, path, InodeType::Directory, mount.resolver.as_ref())
            .await
    }

    /// Creates an empty file. Missing parents are created; an existing node
    /// at `path` is a `PathConflict`.
    pub async fn create(&self, domain: &str, path: &str) -> Result<Inode> {
        self.create_node(domain, path, InodeType::File).await
    }

    pub async fn create_archive(&self, domain: &str, path: &str) -> Result<Inode> {
        self.create_node(domain, path, InodeType::Archive).await
    }

    async fn create_node(&self, domain: &str, path: &str, inode_type: InodeType) -> Result<Inode> {
        self.state.check()?;
        let mount = self.mount_for(domain)?;
        self.store
            .create_new(domain, path, inode_type, mount.resolver.as_ref())
            .await
    }

    pub async fn get(&self, domain: &str, path: &str) -> Result<Option<Inode>> {
        self.state.check()?;
        self.store.get(domain, path).await
    }

    pub async fn update(&self, inode: Inode) -> Result<Inode> {
        self.state.check()?;
        self.store.update(inode).await
    }

    pub async fn list(&self, domain: &str, path: &str, recursive: bool) -> Result<Vec<Inode>> {
        self.state.check()?;
        self.store.list(domain, path, recursive).await
    }

    /// Removes the metadata, then the backend content. A failed backend
    /// delete leaves an orphaned object: it is logged and broadcast as
    /// [`FsEvent::Orphaned`] but does not fail the call.
    pub async fn delete(&self, domain: &str, path: &str, recursive: bool) -> Result<bool> {
        self.state.check()?;
        let mount = self.mount_for(domain)?;
        let Some(target) = self.store.get(domain, path).await? else {
            return Ok(false);
        };
        if target.is_root() {
            return Err(FsError::RootNotDeletable {
                domain: domain.to_string(),
            });
        }
        let descendants = if target.is_directory() && recursive {
            self.store.list(domain, path, true).await?
        } else {
            Vec::new()
        };

        if !self.store.delete(domain, path, recursive).await? {
            return Ok(false);
        }
        self.cache.invalidate(&target.uuid).await;
        for inode in &descendants {
            self.cache.invalidate(&inode.uuid).await;
        }

        let info = mount.resolver.parse(&target.path)?;
        match mount.backend.delete(&info.addr, recursive).await {
            Ok(removed) => debug!("backend delete of {} (existed: {removed})", info.addr),
            Err(e) => {
                warn!(
                    "metadata for {domain}:{} deleted but backend object {} remains: {e}",
                    target.absolute_path, info.addr
                );
                let _ = self.events.send(FsEvent::Orphaned {
                    domain: domain.to_string(),
                    path: target.absolute_path.clone(),
                    addr: info.addr.to_string(),
                    error: e.to_string(),
                });
            }
        }
        Ok(true)
    }

    /// Regular files under `path` whose name fully matches
    /// `file_pattern` and, if given, whose parent's display path fully
    /// matches `dir_pattern`.
    pub async fn find(
        &self,
        domain: &str,
        path: &str,
        dir_pattern: Option<&str>,
        file_pattern: &str,
    ) -> Result<Vec<Inode>> {
        self.state.check()?;
        let file_re = full_match(file_pattern)?;
        let dir_re = dir_pattern.map(full_match).transpose()?;

        let mut parents: HashMap<String, String> = HashMap::new();
        let mut found = Vec::new();
        for inode in self.store.list(domain, path, true).await? {
            if !inode.is_file() || !file_re.is_match(&inode.name) {
                continue;
            }
            if let Some(dir_re) = &dir_re {
                let parent = self.parent_display_path(&inode, &mut parents).await?;
                if !dir_re.is_match(&parent) {
                    continue;
                }
            }
            found.push(inode);
        }
        Ok(found)
    }

    async fn parent_display_path(
        &self,
        inode: &Inode,
        memo: &mut HashMap<String, String>,
    ) -> Result<String> {
        let Some(parent) = inode.parent.as_deref() else {
            return Ok("/".to_string());
        };
        if let Some(display) = memo.get(parent) {
            return Ok(display.clone());
        }
        let display = self
            .store
            .get_by_zk_path(parent)
            .await?
            .map(|p| p.absolute_path)
            .ok_or_else(|| FsError::PathNotFound(parent.to_string()))?;
        memo.insert(parent.to_string(), display.clone());
        Ok(display)
    }

    /// Backend address of `inode`, re-derived from its stored path config.
    pub fn path_info(&self, inode: &Inode) -> Result<PathInfo> {
        self.mount_for(&inode.domain)?.resolver.parse(&inode.path)
    }

    /// Whether the backend holds content for `path`, independent of metadata.
    pub async fn exists(&self, domain: &str, path: &str) -> Result<bool> {
        self.state.check()?;
        let mount = self.mount_for(domain)?;
        let info = mount.resolver.resolve(domain, path)?;
        info.exists(mount.backend.as_ref()).await
    }

    pub async fn size(&self, inode: &Inode) -> Result<u64> {
        self.state.check()?;
        let mount = self.mount_for(&inode.domain)?;
        let info = mount.resolver.parse(&inode.path)?;
        info.size(mount.backend.as_ref()).await
    }

    /// Queues `source` for upload as the content of `inode` and returns
    /// without waiting for the backend.
    pub fn upload(&self, source: &Path, inode: Inode, clear_lock: bool) -> Result<UploadHandle> {
        self.state.check()?;
        let mount = self.mount_for(&inode.domain)?;
        let info = mount.resolver.parse(&inode.path)?;
        self.uploads.submit(UploadRequest {
            inode,
            source: source.to_path_buf(),
            clear_lock,
            backend: mount.backend.clone(),
            addr: info.addr,
        })
    }

    /// Local copy of the file's content. Waits up to `timeout` while another
    /// client is updating the file; unchanged content is served from the
    /// download cache.
    pub async fn download(&self, inode: &Inode, timeout: Duration) -> Result<PathBuf> {
        self.state.check()?;
        if inode.file_info().is_none() {
            return Err(FsError::conflict(&inode.zk_path, "not a file"));
        }
        let current = self.wait_available(inode, timeout).await?;
        let lock = self.cache.download_lock(&current.uuid).await;
        let fetched = {
            let _guard = lock.lock().await;
            self.fetch(&current).await
        };
        self.cache.release_download_lock(&current.uuid, lock).await;
        fetched
    }

    /// Cached copy of `current`, or a fresh one streamed into a part file and
    /// renamed into place. Callers hold the inode's download lock.
    async fn fetch(&self, current: &Inode) -> Result<PathBuf> {
        if let Some(local) = self.cache.lookup(current).await {
            debug!("download cache hit for {}", current.zk_path);
            return Ok(local);
        }

        let mount = self.mount_for(&current.domain)?;
        let info = mount.resolver.parse(&current.path)?;
        let (dir, name) = DownloadCache::local_name(current);
        let local = self.temp.create_tmp_dir(&dir).await?.join(&name);
        let part_name = format!("{name}.{}.part", uuid::Uuid::new_v4().simple());
        let part = self.temp.create_tmp_file(Some(&dir), Some(&part_name)).await?;

        let copied: Result<u64> = async {
            let mut stream = match mount.backend.get(&info.addr).await {
                Ok(stream) => stream,
                // never synced: empty content
                Err(BackendError::NotFound(_)) if current.sync_timestamp == 0 => {
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            };
            let mut file = tokio::fs::File::create(&part).await?;
            let n = tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            Ok(n)
        }
        .await;
        let n = match copied {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&part, &local).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }
        debug!("downloaded {} ({n} bytes) to {}", info.addr, local.display());
        self.cache.insert(current, local.clone()).await;
        Ok(local)
    }

    async fn wait_available(&self, inode: &Inode, timeout: Duration) -> Result<Inode> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self
                .store
                .get_by_zk_path(&inode.zk_path)
                .await?
                .ok_or_else(|| FsError::PathNotFound(inode.zk_path.clone()))?;
            if self.is_available(&current) {
                return Ok(current);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FsError::Unavailable {
                    path: current.zk_path,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(AVAILABILITY_POLL.min(deadline - now)).await;
        }
    }

    fn is_available(&self, inode: &Inode) -> bool {
        match inode.lock() {
            None => true,
            Some(lock) if lock.client_id == self.settings.id => true,
            Some(_) => !inode.state().is_some_and(|s| s.marked_for_update()),
        }
    }

    pub async fn reader(&self, domain: &str, path: &str) -> Result<Reader> {
        let inode = self
            .get(domain, path)
            .await?
            .ok_or_else(|| FsError::PathNotFound(format!("{domain}:{path}")))?;
        let local = self.download(&inode, self.settings.download_timeout()).await?;
        Reader::open(inode, local).await
    }

    /// Opens `path` for writing, creating it if needed, and takes its content
    /// lock. Without `overwrite` the staged bytes start from the current
    /// backend content.
    pub async fn writer(&self, domain: &str, path: &str, overwrite: bool) -> Result<Writer<'_>> {
        self.state.check()?;
        let mount = self.mount_for(domain)?;
        let inode = self
            .store
            .create_path(domain, path, InodeType::File, mount.resolver.as_ref())
            .await?;
        let inode = self.content.lock(inode).await?;
        match self.open_staging(mount, &inode, overwrite).await {
            Ok((staging, file)) => Ok(Writer::new(self, inode, staging, file)),
            Err(e) => {
                if let Err(unlock) = self.content.unlock(inode).await {
                    warn!("failed to release content lock after writer error: {unlock}");
                }
                Err(e)
            }
        }
    }

    async fn open_staging(
        &self,
        mount: &DomainMount,
        inode: &Inode,
        overwrite: bool,
    ) -> Result<(PathBuf, tokio::fs::File)> {
        let staging = inode
            .lock()
            .and_then(|l| l.local_path.as_deref())
            .map(PathBuf::from)
            .ok_or_else(|| FsError::NotLocked {
                path: inode.zk_path.clone(),
                owner_id: None,
            })?;
        if overwrite {
            let file = tokio::fs::File::create(&staging).await?;
            return Ok((staging, file));
        }
        let staged = tokio::fs::metadata(&staging)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if staged == 0 {
            let info = mount.resolver.parse(&inode.path)?;
            match mount.backend.get(&info.addr).await {
                Ok(mut stream) => {
                    let mut file = tokio::fs::File::create(&staging).await?;
                    let n = tokio::io::copy(&mut stream, &mut file).await?;
                    file.flush().await?;
                    debug!("seeded {} with {n} bytes from {}", staging.display(), info.addr);
                }
                Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;
        Ok((staging, file))
    }

    pub async fn file_lock(&self, inode: Inode) -> Result<Inode> {
        self.state.check()?;
        self.content.lock(inode).await
    }

    pub async fn file_unlock(&self, inode: Inode) -> Result<Inode> {
        self.state.check()?;
        self.content.unlock(inode).await
    }

    pub async fn file_update_lock(&self, inode: Inode) -> Result<Inode> {
        self.state.check()?;
        self.content.update_lock(inode).await
    }

    pub async fn is_file_locked(&self, inode: &Inode) -> Result<bool> {
        self.state.check()?;
        self.content.is_locked(inode).await
    }

    /// Stops the evictor, drains queued uploads and marks the file system
    /// closed. Further operations fail with `NotConnected`.
    pub async fn close(&self) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        self.state.set(ConnectionState::Closed);
        self.cancel.cancel();
        if let Some(handle) = self.evictor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("temp evictor ended abnormally: {e}");
            }
        }
        self.uploads.shutdown().await;
        info!("unmounted {}", self.settings.name);
    }
}

impl Drop for VirtualFileSystem {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn full_match(pattern: &str) -> Result<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}
