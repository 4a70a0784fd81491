//! Error taxonomy shared by every layer of the file store.

use crate::cadapter::BackendError;
use crate::coord::CoordError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("path conflict at {path}: {reason}")]
    PathConflict { path: String, reason: String },
    #[error("stale inode {path}: local update timestamp {local} < stored {stored}")]
    StaleInode {
        path: String,
        local: i64,
        stored: i64,
    },
    #[error("timed out after {timeout_ms}ms waiting for lock on {path}")]
    LockTimeout { path: String, timeout_ms: u64 },
    #[error("file already locked by client {owner_id}")]
    FileAlreadyLocked { owner_id: String },
    #[error("file {path} is not locked by this client (owner: {owner_id:?})")]
    NotLocked {
        path: String,
        owner_id: Option<String>,
    },
    #[error(transparent)]
    BackendIo(#[from] BackendError),
    #[error("domain not registered: {0}")]
    DomainNotRegistered(String),
    #[error("the root of domain {domain} cannot be deleted")]
    RootNotDeletable { domain: String },
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("file {path} still being updated after {timeout_ms}ms")]
    Unavailable { path: String, timeout_ms: u64 },
    #[error("file system is not connected (state: {state})")]
    NotConnected { state: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("upload of {path} was aborted before completion")]
    UploadAborted { path: String },
    #[error(transparent)]
    Coordination(CoordError),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InvalidPattern(#[from] regex::Error),
}

impl From<CoordError> for FsError {
    fn from(e: CoordError) -> Self {
        match e {
            CoordError::NoNode(path) => FsError::PathNotFound(path),
            CoordError::LockTimeout { path, timeout_ms } => FsError::LockTimeout { path, timeout_ms },
            CoordError::NotEmpty(path) => FsError::PathConflict {
                path,
                reason: "node has children".to_string(),
            },
            CoordError::NodeExists(path) => FsError::PathConflict {
                path,
                reason: "node already exists".to_string(),
            },
            other => FsError::Coordination(other),
        }
    }
}

impl FsError {
    pub(crate) fn conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        FsError::PathConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        FsError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
