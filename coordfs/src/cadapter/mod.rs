//! Storage backend adapter (cAdapter)
//!
//! Submodules:
//! - `path`: [`PathInfo`], backend addresses and the resolvers that derive them
//! - `localfs`: local-directory backend
//! - `s3`: S3-compatible backend
//!
//! Responsibilities summary:
//! - Define the driver contract the upload/download paths rely on:
//!   exists / size / head / get (stream) / put (local file) / delete.
//! - Normalize the address layout of each backend and implement retries/backoff.
pub mod localfs;
pub mod path;
pub mod s3;

pub use localfs::LocalFsBackend;
pub use path::{BackendAddr, LocalResolver, PathInfo, PathResolver, S3Resolver};
pub use s3::{S3Backend, S3Config};

use crate::config::{Container, ContainerKind};
use async_trait::async_trait;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub type ObjectStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("backend {backend} cannot serve address {addr}")]
    InvalidAddress { backend: String, addr: String },
    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("s3 error: {0}")]
    S3(String),
}

/// `headMetadata` result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: i64,
}

/// Backend response to a completed `put`, consumed by the upload callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResponse {
    pub size: u64,
    pub last_modified: i64,
    pub etag: Option<String>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn exists(&self, addr: &BackendAddr) -> Result<bool, BackendError>;

    async fn size(&self, addr: &BackendAddr) -> Result<u64, BackendError> {
        Ok(self.head(addr).await?.size)
    }

    async fn head(&self, addr: &BackendAddr) -> Result<ObjectMeta, BackendError>;

    async fn get(&self, addr: &BackendAddr) -> Result<ObjectStream, BackendError>;

    async fn put(&self, addr: &BackendAddr, source: &Path) -> Result<PutResponse, BackendError>;

    /// Returns `false` when nothing existed at `addr`.
    async fn delete(&self, addr: &BackendAddr, recursive: bool) -> Result<bool, BackendError>;
}

/// Builds the driver and resolver for a configured container.
pub async fn connect_backend(
    container: &Container,
) -> Result<(Arc<dyn StorageBackend>, Arc<dyn PathResolver>), BackendError> {
    match &container.kind {
        ContainerKind::Local { root } => {
            tokio::fs::create_dir_all(root).await?;
            Ok((
                Arc::new(LocalFsBackend::new(root)),
                Arc::new(LocalResolver::new(root)),
            ))
        }
        ContainerKind::S3 {
            bucket,
            region,
            endpoint,
            prefix,
        } => {
            let config = S3Config {
                region: region.clone(),
                endpoint: endpoint.clone(),
                ..S3Config::default()
            };
            let backend = S3Backend::new(bucket.clone(), config).await?;
            Ok((
                Arc::new(backend),
                Arc::new(S3Resolver::new(bucket.clone(), prefix.clone())),
            ))
        }
    }
}

/// Resolver for a container without connecting its driver.
pub fn resolver_for(container: &Container) -> Arc<dyn PathResolver> {
    match &container.kind {
        ContainerKind::Local { root } => Arc::new(LocalResolver::new(root)),
        ContainerKind::S3 { bucket, prefix, .. } => {
            Arc::new(S3Resolver::new(bucket.clone(), prefix.clone()))
        }
    }
}
