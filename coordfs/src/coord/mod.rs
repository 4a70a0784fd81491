//! Coordination service adapter
//!
//! Responsibilities:
//! - Expose the hierarchical node store consumed by the metadata layer:
//!   create / read / write / delete(recursive) / list-children / exists.
//! - Hand out distributed mutexes keyed by node path as [`ScopedLock`]s
//!   that are released on every exit path.
//!
//! Submodules:
//! - `etcd`: production client backed by etcd (nodes as keys, etcd lock service for mutexes)
//! - `memory`: in-process tree used by tests and single-node development
//! - `lock`: [`LockManager`], the root/domain/node lock layer used by the inode store
pub mod etcd;
pub mod lock;
pub mod memory;

pub use etcd::EtcdCoordinator;
pub use lock::LockManager;
pub use memory::MemoryCoordinator;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, warn};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CoordError {
    #[error("node does not exist: {0}")]
    NoNode(String),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("timed out after {timeout_ms}ms acquiring mutex {path}")]
    LockTimeout { path: String, timeout_ms: u64 },
    #[error(transparent)]
    Etcd(#[from] Box<etcd_client::Error>),
    #[error("{0}")]
    Other(String),
}

impl From<etcd_client::Error> for CoordError {
    fn from(e: etcd_client::Error) -> Self {
        CoordError::Etcd(Box::new(e))
    }
}

/// Hierarchical node storage plus a distributed mutex factory.
///
/// Paths are absolute, `/`-separated and never end with `/` (except the
/// implicit root `/`). Every operation is atomic per path.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Creates `path` and any missing ancestors with empty data. No-op when present.
    async fn create_recursive(&self, path: &str) -> Result<(), CoordError>;

    /// Atomic create-if-absent. The parent must already exist.
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), CoordError>;

    /// `None` when the node does not exist.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError>;

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordError>;

    /// Returns `false` when the node did not exist.
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, CoordError>;

    /// Names (not paths) of the direct children, sorted.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    async fn acquire_mutex(&self, path: &str, timeout: Duration)
    -> Result<ScopedLock, CoordError>;
}

/// A held distributed mutex.
///
/// Call [`ScopedLock::release`] on the happy path; if the lock is dropped
/// instead (early return, error, panic) the release runs in the background
/// on the current runtime.
pub struct ScopedLock {
    path: String,
    release: Option<BoxFuture<'static, Result<(), CoordError>>>,
}

impl ScopedLock {
    pub fn new<F>(path: impl Into<String>, release: F) -> Self
    where
        F: std::future::Future<Output = Result<(), CoordError>> + Send + 'static,
    {
        Self {
            path: path.into(),
            release: Some(Box::pin(release)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn release(mut self) -> Result<(), CoordError> {
        match self.release.take() {
            Some(fut) => {
                debug!("releasing lock {}", self.path);
                fut.await
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        let Some(fut) = self.release.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fut.await {
                        warn!("background release of lock {path} failed: {e}");
                    }
                });
            }
            Err(_) => warn!("lock {path} dropped outside a runtime; relying on lease expiry"),
        }
    }
}

impl std::fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("path", &self.path)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Joins a node path and a single child segment.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of a node path; `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Key prefix shared by every descendant of `path`.
pub(crate) fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}
