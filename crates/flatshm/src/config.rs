//! Configuration for shared memory channels

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Permission bits for newly created segments and semaphores (rw for all).
pub const DEFAULT_MODE: u32 = 0o666;

/// Thread name of the Mutex-Channel snapshot worker.
pub const DEFAULT_WORKER_NAME: &str = "flatshm-swap";

/// Which instance removes a shared object name on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlinkPolicy {
    /// Only the instance whose exclusive create succeeded unlinks.
    #[default]
    CreatorOnly,
    /// Every instance unlinks on teardown.
    Always,
}

impl UnlinkPolicy {
    /// Whether an instance with the given ownership should unlink.
    pub const fn should_unlink(self, is_creator: bool) -> bool {
        match self {
            Self::CreatorOnly => is_creator,
            Self::Always => true,
        }
    }
}

/// Configuration shared by all channel kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Permission bits for objects this process creates
    pub mode: u32,

    /// Teardown unlink ownership
    pub unlink_policy: UnlinkPolicy,

    /// Name of the background snapshot thread
    pub worker_name: String,

    /// Default timeout for waiting on a snapshot swap
    #[serde(with = "duration_millis")]
    pub snapshot_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: DEFAULT_MODE,
            unlink_policy: UnlinkPolicy::default(),
            worker_name: DEFAULT_WORKER_NAME.to_string(),
            snapshot_timeout: Duration::from_secs(1),
        }
    }
}

impl ChannelConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set permission bits for created objects
    #[must_use]
    pub const fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Set the unlink policy
    #[must_use]
    pub const fn with_unlink_policy(mut self, policy: UnlinkPolicy) -> Self {
        self.unlink_policy = policy;
        self
    }

    /// Set the background worker thread name
    #[must_use]
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Set the default snapshot wait timeout
    #[must_use]
    pub const fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
