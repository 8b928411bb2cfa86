//! Shared helpers for integration tests

use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Object name unique to this test process and call.
pub fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("flatshm_it_{prefix}_{}_{n}", std::process::id())
}
