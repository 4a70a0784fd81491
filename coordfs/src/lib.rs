//! coordfs: a virtual multi-backend file store whose namespace lives in a
//! coordination service (etcd) and whose file content lives in pluggable
//! backends (local directories, S3).

pub mod cadapter;
pub mod config;
pub mod coord;
pub mod daemon;
pub mod error;
pub mod meta;
pub mod vfs;

pub use error::{FsError, Result};
pub use vfs::VirtualFileSystem;
