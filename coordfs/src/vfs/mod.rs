//! Virtual file system layer
//!
//! Submodules:
//! - `fs`: the mounted facade ([`VirtualFileSystem`]) composing metadata,
//!   content locks, staging, uploads and downloads
//! - `io`: staged [`Writer`] and local [`Reader`]
//! - `cache`: download cache keyed by inode identity and sync timestamp
//! - `tmp`: process-local staging directory
//! - `state`: connection state and broadcast events
pub mod cache;
pub mod fs;
pub mod io;
pub mod state;
pub mod tmp;

pub use fs::VirtualFileSystem;
pub use io::{PendingUpload, Reader, Writer};
pub use state::{ConnectionState, FsEvent, FsState};
pub use tmp::TempStore;
