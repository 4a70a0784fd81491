//! Structural locks over coordination-tree paths.
//!
//! Callers take locks top-down (root, then domain, then node) and never hold
//! an ancestor and a descendant lock in the opposite order.

use super::{CoordinationClient, ScopedLock, join};
use crate::error::{FsError, Result};
use log::debug;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct LockManager {
    client: Arc<dyn CoordinationClient>,
    base_path: String,
    timeout: Duration,
}

impl LockManager {
    pub fn new(client: Arc<dyn CoordinationClient>, base_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_path: base_path.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn domain_path(&self, domain: &str) -> String {
        join(&self.base_path, domain)
    }

    pub async fn acquire(&self, path: &str) -> Result<ScopedLock> {
        self.acquire_with_timeout(path, self.timeout).await
    }

    /// Fails with `PathNotFound` when the target does not exist and with
    /// `LockTimeout` when the mutex is not obtained in time. Never retries.
    pub async fn acquire_with_timeout(&self, path: &str, timeout: Duration) -> Result<ScopedLock> {
        if !self.client.exists(path).await? {
            return Err(FsError::PathNotFound(path.to_string()));
        }
        let lock = self.client.acquire_mutex(path, timeout).await?;
        debug!("lock held: {path}");
        Ok(lock)
    }

    /// Lock over the whole file-system tree, used for domain bootstrap.
    pub async fn root_lock(&self) -> Result<ScopedLock> {
        self.acquire(&self.base_path).await
    }

    pub async fn domain_lock(&self, domain: &str) -> Result<ScopedLock> {
        self.acquire(&self.domain_path(domain)).await
    }
}

/// Releases `lock`, logging instead of failing: the guarded operation has
/// already produced its result.
pub(crate) async fn release_quietly(lock: ScopedLock) {
    let path = lock.path().to_string();
    if let Err(e) = lock.release().await {
        log::warn!("failed to release lock {path}: {e}");
    }
}
