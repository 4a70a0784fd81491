//! Background workers of a mounted file system
//!
//! Responsibilities:
//! - Run backend uploads off the caller's task on a fixed-size pool and
//!   report completion through per-upload result channels.
//! - Periodically evict expired files from the local staging area.
//!
//! Submodules:
//! - `upload`: upload pool and the sync callbacks driving file state
//! - `evictor`: staging-area TTL eviction task
pub mod evictor;
pub mod upload;

pub use evictor::spawn_evictor;
pub use upload::{SyncCallbacks, UploadHandle, UploadPipeline, UploadRequest};
