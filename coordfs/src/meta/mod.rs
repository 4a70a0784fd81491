//! Metadata layer
//!
//! Responsibilities:
//! - Define the inode record persisted at every coordination-tree node.
//! - Own the create/get/update/delete/list protocol over that tree, with the
//!   optimistic timestamp check that rejects stale writers.
//! - Track per-file content ownership (content locks) inside the file inode.
//!
//! Submodules:
//! - `inode`: inode record, file state machine and lock record
//! - `store`: [`InodeStore`], tree CRUD and domain bootstrap
//! - `content_lock`: [`ContentLocks`], lock/unlock/heartbeat of file content
pub mod content_lock;
pub mod inode;
pub mod store;

pub use content_lock::ContentLocks;
pub use inode::{FileInfo, FileInodeLock, FileState, Inode, InodeKind, InodeType};
pub use store::InodeStore;
