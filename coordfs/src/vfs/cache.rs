//! Downloaded-content cache keyed by inode identity.

use crate::meta::inode::Inode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Clone, Debug)]
struct CachedCopy {
    sync_timestamp: i64,
    local: PathBuf,
}

pub struct DownloadCache {
    entries: moka::future::Cache<String, CachedCopy>,
    // one in-flight download per inode
    download_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl DownloadCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: moka::future::Cache::builder().max_capacity(capacity).build(),
            download_locks: RwLock::new(HashMap::new()),
        }
    }

    /// Download lock for `uuid`. Hold it across lookup, fetch and insert,
    /// then hand it back with [`DownloadCache::release_download_lock`].
    pub async fn download_lock(&self, uuid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.download_locks.write().await;
        locks
            .entry(uuid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the table entry once no other download holds or waits on it.
    pub async fn release_download_lock(&self, uuid: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.download_locks.write().await;
        // table + ours
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(uuid);
        }
    }

    #[cfg(test)]
    async fn pending_downloads(&self) -> usize {
        self.download_locks.read().await.len()
    }

    /// Local copy of `inode`'s content if one was fetched for its current
    /// `sync_timestamp` and has not been evicted from disk since.
    pub async fn lookup(&self, inode: &Inode) -> Option<PathBuf> {
        let cached = self.entries.get(&inode.uuid).await?;
        if cached.sync_timestamp == inode.sync_timestamp
            && tokio::fs::try_exists(&cached.local).await.unwrap_or(false)
        {
            return Some(cached.local);
        }
        self.entries.invalidate(&inode.uuid).await;
        None
    }

    pub async fn insert(&self, inode: &Inode, local: PathBuf) {
        self.entries
            .insert(
                inode.uuid.clone(),
                CachedCopy {
                    sync_timestamp: inode.sync_timestamp,
                    local,
                },
            )
            .await;
    }

    pub async fn invalidate(&self, uuid: &str) {
        self.entries.invalidate(uuid).await;
    }

    /// (relative dir, file name) under the temp root for a downloaded copy.
    pub fn local_name(inode: &Inode) -> (String, String) {
        let mut hasher = Sha256::new();
        hasher.update(inode.uuid.as_bytes());
        hasher.update(inode.sync_timestamp.to_be_bytes());
        let hash_str = hex::encode(hasher.finalize());
        (
            format!("downloads/{}", &hash_str[0..2]),
            hash_str[2..].to_string(),
        )
    }
}
