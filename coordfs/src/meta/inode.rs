//! Inode records stored as the value of each coordination-tree node.

use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeType {
    Directory,
    File,
    Archive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileState {
    New,
    Updating,
    PendingSync,
    Synced,
    Error,
}

impl FileState {
    /// Content is (or is about to be) rewritten by the lock owner.
    pub fn marked_for_update(self) -> bool {
        matches!(
            self,
            FileState::New | FileState::Updating | FileState::PendingSync
        )
    }

    pub fn synced(self) -> bool {
        self == FileState::Synced
    }
}

/// Content lock: which client may stage and upload this file's bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInodeLock {
    pub client_id: String,
    pub fs_name: String,
    pub local_path: Option<String>,
    pub time_updated: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub state: FileState,
    pub lock: Option<FileInodeLock>,
    pub tmp_path: Option<String>,
    pub synced_size: u64,
}

impl Default for FileInfo {
    fn default() -> Self {
        Self {
            state: FileState::New,
            lock: None,
            tmp_path: None,
            synced_size: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InodeKind {
    Directory,
    File(FileInfo),
    Archive(FileInfo),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub uuid: String,
    pub domain: String,
    pub name: String,
    /// Path config of the backend address, see `PathInfo::path_config`.
    pub path: BTreeMap<String, String>,
    pub absolute_path: String,
    /// `zk_path` of the parent node; `None` for a domain root.
    pub parent: Option<String>,
    pub create_timestamp: i64,
    pub update_timestamp: i64,
    pub sync_timestamp: i64,
    pub zk_path: String,
    #[serde(flatten)]
    pub kind: InodeKind,
}

impl Inode {
    pub fn new(
        inode_type: InodeType,
        domain: &str,
        name: &str,
        absolute_path: &str,
        zk_path: &str,
        parent: Option<String>,
        path: BTreeMap<String, String>,
    ) -> Self {
        let now = now_millis();
        let kind = match inode_type {
            InodeType::Directory => InodeKind::Directory,
            InodeType::File => InodeKind::File(FileInfo::default()),
            InodeType::Archive => InodeKind::Archive(FileInfo::default()),
        };
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            domain: domain.to_string(),
            name: name.to_string(),
            path,
            absolute_path: absolute_path.to_string(),
            parent,
            create_timestamp: now,
            update_timestamp: now,
            sync_timestamp: 0,
            zk_path: zk_path.to_string(),
            kind,
        }
    }

    pub fn inode_type(&self) -> InodeType {
        match self.kind {
            InodeKind::Directory => InodeType::Directory,
            InodeKind::File(_) => InodeType::File,
            InodeKind::Archive(_) => InodeType::Archive,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, InodeKind::File(_))
    }

    pub fn is_archive(&self) -> bool {
        matches!(self.kind, InodeKind::Archive(_))
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Content bearing (file or archive) info.
    pub fn file_info(&self) -> Option<&FileInfo> {
        match &self.kind {
            InodeKind::File(info) | InodeKind::Archive(info) => Some(info),
            InodeKind::Directory => None,
        }
    }

    pub fn file_info_mut(&mut self) -> Option<&mut FileInfo> {
        match &mut self.kind {
            InodeKind::File(info) | InodeKind::Archive(info) => Some(info),
            InodeKind::Directory => None,
        }
    }

    pub fn state(&self) -> Option<FileState> {
        self.file_info().map(|f| f.state)
    }

    pub fn lock(&self) -> Option<&FileInodeLock> {
        self.file_info().and_then(|f| f.lock.as_ref())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Wall-clock time, forced strictly past `prev` so stored clocks only grow.
pub fn next_timestamp(prev: i64) -> i64 {
    now_millis().max(prev + 1)
}
