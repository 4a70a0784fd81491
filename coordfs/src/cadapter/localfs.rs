//! 本地文件目录后端：内容直接落在某个本地根目录下，用于单机部署与测试。

use super::{BackendAddr, BackendError, ObjectMeta, ObjectStream, PutResponse, StorageBackend};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for<'a>(&self, addr: &'a BackendAddr) -> Result<&'a Path, BackendError> {
        match addr {
            BackendAddr::Local { path } => Ok(path),
            other => Err(BackendError::InvalidAddress {
                backend: self.name().to_string(),
                addr: other.to_string(),
            }),
        }
    }
}

fn modified_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn exists(&self, addr: &BackendAddr) -> Result<bool, BackendError> {
        Ok(fs::try_exists(self.path_for(addr)?).await?)
    }

    async fn head(&self, addr: &BackendAddr) -> Result<ObjectMeta, BackendError> {
        let path = self.path_for(addr)?;
        match fs::metadata(path).await {
            Ok(meta) => Ok(ObjectMeta {
                size: meta.len(),
                last_modified: modified_millis(&meta),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(addr.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, addr: &BackendAddr) -> Result<ObjectStream, BackendError> {
        let path = self.path_for(addr)?;
        match fs::File::open(path).await {
            Ok(f) => Ok(Box::pin(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(addr.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, addr: &BackendAddr, source: &Path) -> Result<PutResponse, BackendError> {
        let path = self.path_for(addr)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        // 先写临时文件再 rename，读者不会看到半截内容
        let staging = path.with_extension(format!("upload-{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = fs::copy(source, &staging).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        fs::rename(&staging, path).await?;
        let meta = fs::metadata(path).await?;
        Ok(PutResponse {
            size: meta.len(),
            last_modified: modified_millis(&meta),
            etag: None,
        })
    }

    async fn delete(&self, addr: &BackendAddr, recursive: bool) -> Result<bool, BackendError> {
        let path = self.path_for(addr)?;
        let meta = match fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(path).await?;
            } else {
                fs::remove_dir(path).await?;
            }
        } else {
            fs::remove_file(path).await?;
        }
        Ok(true)
    }
}
