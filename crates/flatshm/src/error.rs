//! Error types for shared memory channel operations

use std::io;
use thiserror::Error;

/// Errors that can occur while creating, using or tearing down a channel.
///
/// Repairing a stale semaphore counter is not an error; it is reported
/// through a `tracing` warning and the operation proceeds.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Backing shared memory object could not be opened, resized, mapped
    /// or unlinked.
    #[error("shared memory {op} failed for {name}: {source}")]
    Resource {
        /// Object name as passed by the caller.
        name: String,
        /// Failing operation (`shm_open`, `ftruncate`, `mmap`, ...).
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Named semaphore could not be opened, queried, waited on or posted.
    #[error("semaphore {op} failed for {name}: {source}")]
    Synchronization {
        /// Semaphore name.
        name: String,
        /// Failing operation (`sem_open`, `sem_wait`, ...).
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Object name cannot be used in the shared memory namespace.
    #[error("invalid object name: {0:?}")]
    InvalidName(String),

    /// Background worker could not be spawned.
    #[error("background worker error: {0}")]
    Runner(String),

    /// Operation issued after the owning component was shut down.
    #[error("component already closed")]
    Closed,
}

impl ShmError {
    /// Build a [`ShmError::Resource`] from the last OS error.
    pub(crate) fn resource(name: &str, op: &'static str) -> Self {
        Self::Resource {
            name: name.to_string(),
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Build a [`ShmError::Synchronization`] from the last OS error.
    pub(crate) fn sync(name: &str, op: &'static str) -> Self {
        Self::Synchronization {
            name: name.to_string(),
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Underlying OS error, if any.
    pub fn os_error(&self) -> Option<&io::Error> {
        match self {
            Self::Resource { source, .. } | Self::Synchronization { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the error is `EAGAIN` from a non-blocking operation.
    pub fn is_would_block(&self) -> bool {
        self.os_error()
            .is_some_and(|e| e.kind() == io::ErrorKind::WouldBlock)
    }

    /// Whether the error reports a missing object (`ENOENT`).
    pub fn is_not_found(&self) -> bool {
        self.os_error()
            .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
    }
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ShmError>;
