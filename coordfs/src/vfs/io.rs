//! Staged writers and local readers handed out by [`VirtualFileSystem`].

use super::fs::VirtualFileSystem;
use crate::daemon::UploadHandle;
use crate::error::Result;
use crate::meta::{FileState, Inode};
use log::{debug, warn};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Writes into the staging file of a content-locked file.
///
/// Dropping a writer without [`Writer::commit`] or [`Writer::abort`] keeps
/// the content lock, as a crashed client would.
pub struct Writer<'a> {
    fs: &'a VirtualFileSystem,
    inode: Inode,
    staging: PathBuf,
    file: File,
    written: u64,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(fs: &'a VirtualFileSystem, inode: Inode, staging: PathBuf, file: File) -> Self {
        Self {
            fs,
            inode,
            staging,
            file,
            written: 0,
        }
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    /// Bytes written through this writer (seeded content excluded).
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Refreshes the content lock during long writes.
    pub async fn heartbeat(&mut self) -> Result<()> {
        self.inode = self.fs.file_update_lock(self.inode.clone()).await?;
        Ok(())
    }

    /// Marks the file `PendingSync` and queues the staged bytes for upload.
    /// With `clear_lock` the content lock is released once the upload
    /// succeeds.
    pub async fn commit(mut self, clear_lock: bool) -> Result<PendingUpload> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let mut inode = self.inode;
        if let Some(info) = inode.file_info_mut() {
            info.state = FileState::PendingSync;
            info.tmp_path = Some(self.staging.to_string_lossy().into_owned());
        }
        let inode = self.fs.update(inode).await?;
        let handle = self.fs.upload(&self.staging, inode.clone(), clear_lock)?;
        debug!(
            "committed {} bytes for {}:{}",
            self.written, inode.domain, inode.absolute_path
        );
        Ok(PendingUpload { inode, handle })
    }

    /// Drops the staged bytes and releases the content lock.
    pub async fn abort(self) -> Result<Inode> {
        drop(self.file);
        match tokio::fs::remove_file(&self.staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove staging file {}: {e}", self.staging.display()),
        }
        self.fs.file_unlock(self.inode).await
    }
}

/// A committed write whose upload is queued or running.
pub struct PendingUpload {
    inode: Inode,
    handle: UploadHandle,
}

impl PendingUpload {
    /// Snapshot persisted at commit time, in `PendingSync`.
    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    /// Waits for the upload; on success the returned inode is `Synced` (or
    /// `Updating` when the lock was retained).
    pub async fn wait(self) -> Result<Inode> {
        self.handle.wait().await
    }
}

/// Reads a downloaded local copy of a file.
pub struct Reader {
    inode: Inode,
    local: PathBuf,
    file: File,
}

impl Reader {
    pub(crate) async fn open(inode: Inode, local: PathBuf) -> Result<Self> {
        let file = File::open(&local).await?;
        Ok(Self { inode, local, file })
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn local_path(&self) -> &Path {
        &self.local
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos).await?)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}
