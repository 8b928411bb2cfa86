//! POSIX object naming.
//!
//! `shm_open` and `sem_open` take names of the form `/<component>` where the
//! component contains no further slashes. Channel names are accepted with
//! or without the leading slash.

use std::ffi::CString;

use crate::Result;
use crate::error::ShmError;

/// Longest accepted name component. glibc prefixes semaphore names with
/// `sem.` inside a 255 byte file name.
pub const MAX_NAME_LEN: usize = 250;

/// Suffix of the Mutex-Channel guard semaphore.
pub const MUTEX_SUFFIX: &str = "_sem";

/// Suffix of the Handoff-Channel read token.
pub const READ_SUFFIX: &str = "_read";

/// Suffix of the Handoff-Channel write token.
pub const WRITE_SUFFIX: &str = "_write";

/// Suffix of the SeqLock-Channel segment.
pub const SEQLOCK_SUFFIX: &str = "_seq";

/// Validated POSIX object name (always starts with `/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectName {
    posix: String,
    c_name: CString,
}

impl ObjectName {
    /// Validate a caller-supplied name.
    pub fn new(name: &str) -> Result<Self> {
        let component = name.strip_prefix('/').unwrap_or(name);
        if component.is_empty()
            || component.len() > MAX_NAME_LEN
            || component.contains('/')
            || component == "."
            || component == ".."
        {
            return Err(ShmError::InvalidName(name.to_string()));
        }

        let posix = format!("/{component}");
        let c_name =
            CString::new(posix.clone()).map_err(|_| ShmError::InvalidName(name.to_string()))?;
        Ok(Self { posix, c_name })
    }

    /// Derive a sibling name by appending a suffix (`frames` → `frames_read`).
    pub fn with_suffix(&self, suffix: &str) -> Result<Self> {
        Self::new(&format!("{}{suffix}", self.posix))
    }

    /// Name including the leading slash.
    pub fn as_str(&self) -> &str {
        &self.posix
    }

    /// Name without the leading slash.
    pub fn component(&self) -> &str {
        &self.posix[1..]
    }

    /// NUL-terminated name for libc calls.
    pub fn as_c_str(&self) -> &std::ffi::CStr {
        &self.c_name
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.posix)
    }
}
