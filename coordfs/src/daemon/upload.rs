//! Asynchronous upload pipeline.
//!
//! A fixed set of worker tasks drains one unbounded queue, so backpressure
//! comes from the pool size. Each submitted upload gets its own result
//! channel ([`UploadHandle`]); the sync callbacks drive the file state
//! machine `PendingSync -> Updating -> Synced | Error` through the inode store.

use crate::cadapter::{BackendAddr, PutResponse, StorageBackend};
use crate::error::{FsError, Result};
use crate::meta::inode::{FileState, Inode, next_timestamp};
use crate::meta::store::InodeStore;
use crate::vfs::state::FsEvent;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub struct UploadRequest {
    pub inode: Inode,
    pub source: PathBuf,
    pub clear_lock: bool,
    pub backend: Arc<dyn StorageBackend>,
    pub addr: BackendAddr,
}

struct UploadTask {
    request: UploadRequest,
    reply: oneshot::Sender<Result<Inode>>,
}

/// Completion of one submitted upload.
pub struct UploadHandle {
    path: String,
    rx: oneshot::Receiver<Result<Inode>>,
}

impl UploadHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The inode as persisted by the completion callback, or the upload error.
    pub async fn wait(self) -> Result<Inode> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(FsError::UploadAborted { path: self.path }),
        }
    }
}

/// State transitions applied when an upload is picked up or finishes.
pub struct SyncCallbacks {
    store: Arc<InodeStore>,
    client_id: String,
    events: broadcast::Sender<FsEvent>,
}

impl SyncCallbacks {
    pub fn new(
        store: Arc<InodeStore>,
        client_id: impl Into<String>,
        events: broadcast::Sender<FsEvent>,
    ) -> Self {
        Self {
            store,
            client_id: client_id.into(),
            events,
        }
    }

    async fn fresh(&self, inode: &Inode) -> Result<Inode> {
        let current = self
            .store
            .get_by_zk_path(&inode.zk_path)
            .await?
            .ok_or_else(|| FsError::PathNotFound(inode.zk_path.clone()))?;
        if current.file_info().is_none() {
            return Err(FsError::conflict(&inode.zk_path, "not a file"));
        }
        Ok(current)
    }

    pub async fn mark_updating(&self, inode: &Inode) -> Result<Inode> {
        let mut current = self.fresh(inode).await?;
        if let Some(info) = current.file_info_mut() {
            info.state = FileState::Updating;
        }
        self.store.update(current).await
    }

    /// Records the backend response. With `clear_lock` the file becomes
    /// `Synced` and its content lock is released; otherwise it stays
    /// `Updating` and the lock is refreshed for the next chunk.
    pub async fn on_success(
        &self,
        inode: &Inode,
        response: &PutResponse,
        clear_lock: bool,
    ) -> Result<Inode> {
        let mut current = self.fresh(inode).await?;
        let path = current.zk_path.clone();
        current.sync_timestamp = response.last_modified.max(current.sync_timestamp + 1);
        if let Some(info) = current.file_info_mut() {
            if let Some(lock) = info.lock.as_ref() {
                if lock.client_id != self.client_id {
                    return Err(FsError::NotLocked {
                        path,
                        owner_id: Some(lock.client_id.clone()),
                    });
                }
            }
            info.synced_size = response.size;
            if clear_lock {
                info.state = FileState::Synced;
                info.lock = None;
                info.tmp_path = None;
            } else {
                info.state = FileState::Updating;
                if let Some(lock) = info.lock.as_mut() {
                    lock.time_updated = next_timestamp(lock.time_updated);
                }
            }
        }
        let updated = self.store.update(current).await?;
        info!(
            "uploaded {}:{} ({} bytes)",
            updated.domain, updated.absolute_path, response.size
        );
        let _ = self.events.send(FsEvent::UploadSucceeded {
            domain: updated.domain.clone(),
            path: updated.absolute_path.clone(),
            uuid: updated.uuid.clone(),
            size: response.size,
        });
        Ok(updated)
    }

    /// Marks the file `Error`. The content lock is left in place.
    pub async fn on_error(&self, inode: &Inode, cause: &FsError) -> Result<Inode> {
        error!(
            "upload of {}:{} failed: {cause}",
            inode.domain, inode.absolute_path
        );
        let _ = self.events.send(FsEvent::UploadFailed {
            domain: inode.domain.clone(),
            path: inode.absolute_path.clone(),
            uuid: inode.uuid.clone(),
            error: cause.to_string(),
        });
        let mut current = self.fresh(inode).await?;
        if let Some(info) = current.file_info_mut() {
            info.state = FileState::Error;
        }
        self.store.update(current).await
    }
}

pub struct UploadPipeline {
    queue: Mutex<Option<mpsc::UnboundedSender<UploadTask>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl UploadPipeline {
    pub fn start(threads: usize, callbacks: Arc<SyncCallbacks>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..threads.max(1))
            .map(|id| tokio::spawn(worker(id, rx.clone(), callbacks.clone())))
            .collect();
        Self {
            queue: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(workers),
        }
    }

    /// Enqueues the upload and returns immediately.
    pub fn submit(&self, request: UploadRequest) -> Result<UploadHandle> {
        let path = request.inode.zk_path.clone();
        let (reply, rx) = oneshot::channel();
        let queue = self
            .queue
            .lock()
            .map_err(|_| FsError::UploadAborted { path: path.clone() })?;
        let Some(tx) = queue.as_ref() else {
            return Err(FsError::UploadAborted { path });
        };
        tx.send(UploadTask { request, reply })
            .map_err(|_| FsError::UploadAborted { path: path.clone() })?;
        debug!("queued upload of {path}");
        Ok(UploadHandle { path, rx })
    }

    /// Stops accepting uploads, lets queued ones finish and joins the workers.
    pub async fn shutdown(&self) {
        let sender = match self.queue.lock() {
            Ok(mut q) => q.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("upload worker ended abnormally: {e}");
            }
        }
    }
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<UploadTask>>>;

async fn worker(id: usize, queue: SharedQueue, callbacks: Arc<SyncCallbacks>) {
    loop {
        let task = queue.lock().await.recv().await;
        let Some(UploadTask { request, reply }) = task else {
            break;
        };
        let result = run_upload(&callbacks, request).await;
        let _ = reply.send(result);
    }
    debug!("upload worker {id} stopped");
}

async fn run_upload(callbacks: &SyncCallbacks, request: UploadRequest) -> Result<Inode> {
    let uploaded: Result<Inode> = async {
        let updating = callbacks.mark_updating(&request.inode).await?;
        let response = request.backend.put(&request.addr, &request.source).await?;
        callbacks
            .on_success(&updating, &response, request.clear_lock)
            .await
    }
    .await;
    match uploaded {
        Ok(inode) => Ok(inode),
        Err(e) => {
            if let Err(cb) = callbacks.on_error(&request.inode, &e).await {
                warn!(
                    "could not record failed upload of {}: {cb}",
                    request.inode.zk_path
                );
            }
            Err(e)
        }
    }
}
