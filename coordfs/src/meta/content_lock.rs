//! Content locks: per-file write ownership recorded inside the file inode.
//!
//! Acquisition is first-writer-wins through the optimistic update check of
//! [`InodeStore::update`]; a second client fails immediately instead of
//! queueing.

use crate::error::{FsError, Result};
use crate::meta::inode::{FileInodeLock, Inode, next_timestamp};
use crate::meta::store::InodeStore;
use crate::vfs::tmp::TempStore;
use log::debug;
use std::sync::Arc;

pub struct ContentLocks {
    store: Arc<InodeStore>,
    temp: Arc<TempStore>,
    client_id: String,
    fs_name: String,
}

impl ContentLocks {
    pub fn new(
        store: Arc<InodeStore>,
        temp: Arc<TempStore>,
        client_id: impl Into<String>,
        fs_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            temp,
            client_id: client_id.into(),
            fs_name: fs_name.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn current(&self, inode: &Inode) -> Result<Inode> {
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

    fn owned_lock(&self, current: &Inode) -> Result<FileInodeLock> {
        match current.lock() {
            Some(lock) if lock.client_id == self.client_id => Ok(lock.clone()),
            other => Err(FsError::NotLocked {
                path: current.zk_path.clone(),
                owner_id: other.map(|l| l.client_id.clone()),
            }),
        }
    }

    fn install(inode: &mut Inode, lock: Option<FileInodeLock>) -> Result<()> {
        let path = inode.zk_path.clone();
        let info = inode
            .file_info_mut()
            .ok_or_else(|| FsError::conflict(path, "not a file"))?;
        info.lock = lock;
        Ok(())
    }

    /// Takes (or re-takes) the content lock for this client and makes sure a
    /// staging file exists for it.
    pub async fn lock(&self, mut inode: Inode) -> Result<Inode> {
        let current = self.current(&inode).await?;
        let mut lock = match current.lock() {
            Some(held) if held.client_id != self.client_id => {
                return Err(FsError::FileAlreadyLocked {
                    owner_id: held.client_id.clone(),
                });
            }
            Some(held) => held.clone(),
            None => FileInodeLock {
                client_id: self.client_id.clone(),
                fs_name: self.fs_name.clone(),
                local_path: None,
                time_updated: 0,
            },
        };
        if lock.local_path.is_none() {
            let name = format!("{}.{}", uuid::Uuid::new_v4().simple(), inode.name);
            let staging = self
                .temp
                .create_tmp_file(Some(&inode.domain), Some(&name))
                .await?;
            lock.local_path = Some(staging.to_string_lossy().into_owned());
        }
        lock.time_updated = next_timestamp(lock.time_updated);
        Self::install(&mut inode, Some(lock))?;
        let inode = self.store.update(inode).await?;
        debug!("content lock on {} held by {}", inode.zk_path, self.client_id);
        Ok(inode)
    }

    pub async fn unlock(&self, mut inode: Inode) -> Result<Inode> {
        let current = self.current(&inode).await?;
        self.owned_lock(&current)?;
        Self::install(&mut inode, None)?;
        let inode = self.store.update(inode).await?;
        debug!("content lock on {} released by {}", inode.zk_path, self.client_id);
        Ok(inode)
    }

    /// Heartbeat: refreshes `time_updated` of a lock this client holds.
    pub async fn update_lock(&self, mut inode: Inode) -> Result<Inode> {
        let current = self.current(&inode).await?;
        let mut lock = self.owned_lock(&current)?;
        lock.time_updated = next_timestamp(lock.time_updated);
        Self::install(&mut inode, Some(lock))?;
        self.store.update(inode).await
    }

    /// True while this client owns the lock and the file is still being
    /// written or synced.
    pub async fn is_locked(&self, inode: &Inode) -> Result<bool> {
        let current = self.current(inode).await?;
        let owned = current
            .lock()
            .is_some_and(|l| l.client_id == self.client_id);
        Ok(owned && current.state().is_some_and(|s| s.marked_for_update()))
    }
}
