//! Best-effort release of OS resources.
//!
//! Segments, semaphores and channels all release several resources in a
//! fixed order (unmap, close, unlink; post, unlink, close; stop worker,
//! destroy semaphores, destroy segment). Every step must run even when an
//! earlier one failed. [`Teardown`] runs the steps, logs each failure and
//! hands the first error back to the caller.

use crate::Result;
use crate::error::ShmError;

/// Ordered sequence of independent release steps.
#[must_use = "call finish() to obtain the teardown outcome"]
pub struct Teardown<'a> {
    owner: &'a str,
    first_error: Option<ShmError>,
    failures: usize,
}

impl<'a> Teardown<'a> {
    /// Start a teardown for the named owner.
    pub fn new(owner: &'a str) -> Self {
        Self {
            owner,
            first_error: None,
            failures: 0,
        }
    }

    /// Run one release step, recording a failure without stopping.
    pub fn step(mut self, what: &'static str, f: impl FnOnce() -> Result<()>) -> Self {
        if let Err(err) = f() {
            tracing::warn!(owner = self.owner, step = what, error = %err, "teardown step failed");
            self.failures += 1;
            if self.first_error.is_none() {
                self.first_error = Some(err);
            }
        }
        self
    }

    /// Number of steps that failed so far.
    pub const fn failures(&self) -> usize {
        self.failures
    }

    /// Finish, returning the first recorded failure.
    pub fn finish(self) -> Result<()> {
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// An owner of OS resources that can be released exactly once.
///
/// `release` must be idempotent: a second call is a no-op returning `Ok`.
/// Implementors call it from `Drop`, ignoring the result.
pub trait Release {
    /// Release everything this value owns.
    fn release(&mut self) -> Result<()>;
}
