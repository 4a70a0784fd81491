//! Connection state of a mounted file system and the events it broadcasts.

use crate::error::{FsError, Result};
use std::fmt;
use std::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initialized,
    Connected,
    Closed,
    Error(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Initialized => write!(f, "initialized"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Error(e) => write!(f, "error: {e}"),
        }
    }
}

pub struct FsState {
    inner: RwLock<ConnectionState>,
}

impl Default for FsState {
    fn default() -> Self {
        Self::new()
    }
}

impl FsState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ConnectionState::Initialized),
        }
    }

    pub fn get(&self) -> ConnectionState {
        match self.inner.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, state: ConnectionState) {
        match self.inner.write() {
            Ok(mut s) => *s = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    pub fn set_error(&self, error: impl fmt::Display) {
        self.set(ConnectionState::Error(error.to_string()));
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }

    pub fn check(&self) -> Result<()> {
        match self.get() {
            ConnectionState::Connected => Ok(()),
            other => Err(FsError::NotConnected {
                state: other.to_string(),
            }),
        }
    }
}

/// Notifications for subscribers of a mounted file system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsEvent {
    UploadSucceeded {
        domain: String,
        path: String,
        uuid: String,
        size: u64,
    },
    UploadFailed {
        domain: String,
        path: String,
        uuid: String,
        error: String,
    },
    /// Metadata is gone but the backend object could not be removed.
    Orphaned {
        domain: String,
        path: String,
        addr: String,
        error: String,
    },
    EvictorFailed {
        error: String,
    },
}
