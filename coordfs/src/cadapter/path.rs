//! Path resolution: (domain, relative path) to a backend address, plus the
//! serializable path config stored in every inode so the address can be
//! re-derived from metadata alone.

use super::StorageBackend;
use crate::error::{FsError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const KEY_DOMAIN: &str = "domain";
pub const KEY_PATH: &str = "path";
pub const KEY_TYPE: &str = "type";
pub const KEY_LOCAL_PATH: &str = "local_path";
pub const KEY_BUCKET: &str = "bucket";
pub const KEY_OBJECT_KEY: &str = "key";

const TYPE_LOCAL: &str = "local";
const TYPE_S3: &str = "s3";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendAddr {
    Local { path: PathBuf },
    S3 { bucket: String, key: String },
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddr::Local { path } => write!(f, "file://{}", path.display()),
            BackendAddr::S3 { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo {
    pub domain: String,
    /// Normalized domain-relative path, `/` for the domain root.
    pub path: String,
    pub addr: BackendAddr,
}

impl PathInfo {
    pub fn path_config(&self) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        config.insert(KEY_DOMAIN.to_string(), self.domain.clone());
        config.insert(KEY_PATH.to_string(), self.path.clone());
        match &self.addr {
            BackendAddr::Local { path } => {
                config.insert(KEY_TYPE.to_string(), TYPE_LOCAL.to_string());
                config.insert(KEY_LOCAL_PATH.to_string(), path.to_string_lossy().into_owned());
            }
            BackendAddr::S3 { bucket, key } => {
                config.insert(KEY_TYPE.to_string(), TYPE_S3.to_string());
                config.insert(KEY_BUCKET.to_string(), bucket.clone());
                config.insert(KEY_OBJECT_KEY.to_string(), key.clone());
            }
        }
        config
    }

    pub fn from_config(config: &BTreeMap<String, String>) -> Result<Self> {
        let field = |key: &str| {
            config
                .get(key)
                .cloned()
                .ok_or_else(|| FsError::invalid_path(format!("{config:?}"), format!("missing `{key}`")))
        };
        let addr = match field(KEY_TYPE)?.as_str() {
            TYPE_LOCAL => BackendAddr::Local {
                path: PathBuf::from(field(KEY_LOCAL_PATH)?),
            },
            TYPE_S3 => BackendAddr::S3 {
                bucket: field(KEY_BUCKET)?,
                key: field(KEY_OBJECT_KEY)?,
            },
            other => {
                return Err(FsError::invalid_path(
                    format!("{config:?}"),
                    format!("unknown backend type `{other}`"),
                ));
            }
        };
        Ok(Self {
            domain: field(KEY_DOMAIN)?,
            path: field(KEY_PATH)?,
            addr,
        })
    }

    pub async fn exists(&self, backend: &dyn StorageBackend) -> Result<bool> {
        Ok(backend.exists(&self.addr).await?)
    }

    pub async fn size(&self, backend: &dyn StorageBackend) -> Result<u64> {
        Ok(backend.size(&self.addr).await?)
    }
}

pub trait PathResolver: Send + Sync {
    fn resolve(&self, domain: &str, path: &str) -> Result<PathInfo>;

    /// Rebuilds a `PathInfo` from a stored path config.
    fn parse(&self, config: &BTreeMap<String, String>) -> Result<PathInfo> {
        PathInfo::from_config(config)
    }
}

/// `{root}/{domain}/{path}` on the local disk.
pub struct LocalResolver {
    root: PathBuf,
}

impl LocalResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl PathResolver for LocalResolver {
    fn resolve(&self, domain: &str, path: &str) -> Result<PathInfo> {
        let path = normalize_path(path)?;
        let mut local = self.root.join(domain);
        for seg in segments(&path) {
            local.push(seg);
        }
        Ok(PathInfo {
            domain: domain.to_string(),
            path,
            addr: BackendAddr::Local { path: local },
        })
    }
}

/// `s3://{bucket}/[{prefix}/]{domain}/{path}`.
pub struct S3Resolver {
    bucket: String,
    prefix: Option<String>,
}

impl S3Resolver {
    pub fn new(bucket: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }
}

impl PathResolver for S3Resolver {
    fn resolve(&self, domain: &str, path: &str) -> Result<PathInfo> {
        let path = normalize_path(path)?;
        let mut parts: Vec<&str> = Vec::new();
        if let Some(prefix) = &self.prefix {
            parts.push(prefix);
        }
        parts.push(domain);
        parts.extend(segments(&path));
        Ok(PathInfo {
            domain: domain.to_string(),
            path: path.clone(),
            addr: BackendAddr::S3 {
                bucket: self.bucket.clone(),
                key: parts.join("/"),
            },
        })
    }
}

/// Collapses repeated separators and rejects `.`/`..` segments.
pub fn normalize_path(raw: &str) -> Result<String> {
    let mut parts = Vec::new();
    for seg in raw.split('/').filter(|s| !s.is_empty()) {
        if seg == "." || seg == ".." {
            return Err(FsError::invalid_path(raw, "relative segments are not allowed"));
        }
        parts.push(seg);
    }
    Ok(format!("/{}", parts.join("/")))
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}
