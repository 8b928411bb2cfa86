//! Named POSIX counting semaphores.
//!
//! [`Semaphore::create`] attaches to an existing semaphore when one is
//! already present. A counter outside `0..=initial_value` (or the limit
//! passed to [`Semaphore::with_limit`]) means a previous owner died
//! mid-protocol; the object is then unlinked and recreated so a new process
//! does not deadlock on a stranded counter.

use std::io;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{O_CREAT, O_EXCL, c_int, c_uint, sem_t};

use crate::config::ChannelConfig;
use crate::error::ShmError;
use crate::name::ObjectName;
use crate::teardown::{Release, Teardown};
use crate::{Result, UnlinkPolicy};

/// A named counting semaphore shared between processes.
pub struct Semaphore {
    name: ObjectName,
    handle: Option<NonNull<sem_t>>,
    initial_value: u32,
    max_value: u32,
    last_known_value: AtomicI32,
    creator: bool,
    recovered: bool,
    unlink_policy: UnlinkPolicy,
}

impl Semaphore {
    /// Create or attach with the default configuration.
    pub fn create(name: &str, initial_value: u32) -> Result<Self> {
        Self::with_config(name, initial_value, &ChannelConfig::default())
    }

    /// Create or attach, repairing a stale counter.
    pub fn with_config(name: &str, initial_value: u32, config: &ChannelConfig) -> Result<Self> {
        Self::with_limit(name, initial_value, initial_value, config)
    }

    /// Create or attach, treating counters above `max_value` as stale.
    ///
    /// A hand-off read token starts at 0 but legitimately holds 1 while a
    /// value is buffered, so its limit is 1 rather than its initial value.
    #[allow(unsafe_code)]
    pub fn with_limit(
        name: &str,
        initial_value: u32,
        max_value: u32,
        config: &ChannelConfig,
    ) -> Result<Self> {
        let name = ObjectName::new(name)?;
        let max_value = max_value.max(initial_value);
        let (mut handle, mut creator) = open_or_attach(&name, initial_value, config.mode)?;

        let mut value = match get_value(&name, handle) {
            Ok(value) => value,
            Err(err) => {
                // SAFETY: handle came from sem_open and is not used afterwards.
                unsafe { libc::sem_close(handle.as_ptr()) };
                return Err(err);
            }
        };

        let mut recovered = false;
        if value < 0 || i64::from(value) > i64::from(max_value) {
            tracing::warn!(
                name = %name,
                value,
                max_value,
                "resetting stale semaphore left by an unclean session"
            );
            // SAFETY: handle is valid and not used after close.
            unsafe { libc::sem_close(handle.as_ptr()) };
            let _ = unlink(&name);
            handle = match open(&name, O_CREAT | O_EXCL, initial_value, config.mode) {
                Ok(handle) => {
                    creator = true;
                    handle
                }
                // Another process recreated it between our unlink and open.
                Err(err) if err.os_error().and_then(io::Error::raw_os_error) == Some(libc::EEXIST) => {
                    creator = false;
                    open(&name, 0, initial_value, config.mode)?
                }
                Err(err) => return Err(err),
            };
            value = match get_value(&name, handle) {
                Ok(value) => value,
                Err(err) => {
                    // SAFETY: handle came from sem_open and is not used afterwards.
                    unsafe { libc::sem_close(handle.as_ptr()) };
                    return Err(err);
                }
            };
            recovered = true;
        }

        tracing::debug!(
            name = %name,
            value,
            initial_value,
            creator,
            "{} semaphore",
            if creator { "created" } else { "attached" }
        );

        Ok(Self {
            name,
            handle: Some(handle),
            initial_value,
            max_value,
            last_known_value: AtomicI32::new(value),
            creator,
            recovered,
            unlink_policy: config.unlink_policy,
        })
    }

    /// Remove a semaphore name without opening it.
    ///
    /// Returns `Ok(false)` if no semaphore with that name existed.
    pub fn unlink_name(name: &str) -> Result<bool> {
        let name = ObjectName::new(name)?;
        match unlink(&name) {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn handle(&self) -> Result<NonNull<sem_t>> {
        self.handle.ok_or(ShmError::Closed)
    }

    /// Block until the counter is positive, then decrement it.
    #[allow(unsafe_code)]
    pub fn wait(&self) -> Result<()> {
        let handle = self.handle()?;
        loop {
            // SAFETY: handle stays open until destroy(), which needs &mut self.
            if unsafe { libc::sem_wait(handle.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ShmError::Synchronization {
                    name: self.name.to_string(),
                    op: "sem_wait",
                    source: err,
                });
            }
        }
    }

    /// Decrement the counter if it is positive.
    ///
    /// Returns `Ok(false)` instead of blocking when the counter is zero.
    #[allow(unsafe_code)]
    pub fn try_wait(&self) -> Result<bool> {
        let handle = self.handle()?;
        loop {
            // SAFETY: see wait().
            if unsafe { libc::sem_trywait(handle.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => {}
                io::ErrorKind::WouldBlock => return Ok(false),
                _ => {
                    return Err(ShmError::Synchronization {
                        name: self.name.to_string(),
                        op: "sem_trywait",
                        source: err,
                    });
                }
            }
        }
    }

    /// Increment the counter and wake one waiter.
    #[allow(unsafe_code)]
    pub fn post(&self) -> Result<()> {
        let handle = self.handle()?;
        // SAFETY: see wait().
        if unsafe { libc::sem_post(handle.as_ptr()) } == -1 {
            return Err(ShmError::sync(self.name.as_str(), "sem_post"));
        }
        Ok(())
    }

    /// Current counter value.
    pub fn value(&self) -> Result<i32> {
        let value = get_value(&self.name, self.handle()?)?;
        self.last_known_value.store(value, Ordering::Relaxed);
        Ok(value)
    }

    /// Counter value observed by the most recent query.
    pub fn last_known_value(&self) -> i32 {
        self.last_known_value.load(Ordering::Relaxed)
    }

    /// Acquire the semaphore for the lifetime of the returned guard.
    pub fn acquire(&self) -> Result<SemaphoreGuard<'_>> {
        SemaphoreGuard::new(self)
    }

    /// POSIX name of the semaphore.
    pub const fn name(&self) -> &ObjectName {
        &self.name
    }

    /// Initial value declared at creation.
    pub const fn initial_value(&self) -> u32 {
        self.initial_value
    }

    /// Largest counter value accepted as consistent on attach.
    pub const fn max_value(&self) -> u32 {
        self.max_value
    }

    /// Whether this instance created the named object.
    pub const fn is_creator(&self) -> bool {
        self.creator
    }

    /// Whether creation found and repaired a stale counter.
    pub const fn was_recovered(&self) -> bool {
        self.recovered
    }

    /// Whether the handle is still open.
    pub const fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Post once and unlink if this instance owns the name, then close.
    ///
    /// The post releases a waiter that would otherwise stay blocked on a
    /// name that is going away. An instance that leaves the name in place
    /// only closes, so peers still sharing the counter keep a consistent
    /// value. Calling this again is a no-op.
    pub fn destroy(&mut self) -> Result<()> {
        self.release()
    }
}

impl Release for Semaphore {
    #[allow(unsafe_code)]
    fn release(&mut self) -> Result<()> {
        let Some(handle) = self.handle else {
            return Ok(());
        };
        let should_unlink = self.unlink_policy.should_unlink(self.creator);

        let result = Teardown::new(self.name.as_str())
            .step("sem_post", || {
                if should_unlink { self.post() } else { Ok(()) }
            })
            .step("sem_unlink", || {
                if !should_unlink {
                    return Ok(());
                }
                match unlink(&self.name) {
                    Err(err) if err.is_not_found() => Ok(()),
                    other => other,
                }
            })
            .step("sem_close", || {
                // SAFETY: handle is valid and cleared below, never used again.
                if unsafe { libc::sem_close(handle.as_ptr()) } == -1 {
                    return Err(ShmError::sync(self.name.as_str(), "sem_close"));
                }
                Ok(())
            })
            .finish();

        self.handle = None;
        result
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name.as_str())
            .field("initial_value", &self.initial_value)
            .field("last_known_value", &self.last_known_value())
            .field("creator", &self.creator)
            .field("recovered", &self.recovered)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

// SAFETY: sem_t operations are thread-safe by POSIX; the handle is only
// closed through &mut self.
#[allow(unsafe_code)]
unsafe impl Send for Semaphore {}

// SAFETY: wait/post/getvalue may be called concurrently from any thread.
#[allow(unsafe_code)]
unsafe impl Sync for Semaphore {}

/// Scoped acquisition of a [`Semaphore`].
///
/// Waits on construction and posts on drop, including early returns and
/// unwinding. The guard borrows the semaphore, so it cannot outlive the
/// enclosing scope's access to it, and it is neither `Clone` nor `Send`.
#[must_use = "the semaphore is released as soon as the guard is dropped"]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
    _not_send: PhantomData<*const ()>,
}

impl<'a> SemaphoreGuard<'a> {
    /// Wait on the semaphore and hold it until the guard is dropped.
    pub fn new(semaphore: &'a Semaphore) -> Result<Self> {
        semaphore.wait()?;
        Ok(Self {
            semaphore,
            _not_send: PhantomData,
        })
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.semaphore.post() {
            tracing::warn!(name = %self.semaphore.name, error = %err, "failed to release semaphore guard");
        }
    }
}

#[allow(unsafe_code)]
fn open(name: &ObjectName, oflag: c_int, initial_value: u32, mode: u32) -> Result<NonNull<sem_t>> {
    // SAFETY: valid NUL-terminated name; mode and value are passed as the
    // variadic arguments sem_open expects when O_CREAT is set.
    let sem = unsafe {
        libc::sem_open(
            name.as_c_str().as_ptr(),
            oflag,
            mode as c_uint,
            initial_value as c_uint,
        )
    };
    if sem == libc::SEM_FAILED {
        return Err(ShmError::sync(name.as_str(), "sem_open"));
    }
    NonNull::new(sem).ok_or_else(|| ShmError::Synchronization {
        name: name.to_string(),
        op: "sem_open",
        source: io::Error::other("sem_open returned a null handle"),
    })
}

fn open_or_attach(name: &ObjectName, initial_value: u32, mode: u32) -> Result<(NonNull<sem_t>, bool)> {
    match open(name, O_CREAT | O_EXCL, initial_value, mode) {
        Ok(handle) => Ok((handle, true)),
        Err(err) if err.os_error().and_then(io::Error::raw_os_error) == Some(libc::EEXIST) => {
            open(name, 0, initial_value, mode).map(|handle| (handle, false))
        }
        Err(err) => Err(err),
    }
}

#[allow(unsafe_code)]
fn get_value(name: &ObjectName, handle: NonNull<sem_t>) -> Result<i32> {
    let mut value: c_int = 0;
    // SAFETY: handle is an open semaphore, value is a valid out pointer.
    if unsafe { libc::sem_getvalue(handle.as_ptr(), &raw mut value) } == -1 {
        return Err(ShmError::sync(name.as_str(), "sem_getvalue"));
    }
    Ok(value)
}

#[allow(unsafe_code)]
fn unlink(name: &ObjectName) -> Result<()> {
    // SAFETY: valid NUL-terminated name.
    if unsafe { libc::sem_unlink(name.as_c_str().as_ptr()) } == -1 {
        return Err(ShmError::sync(name.as_str(), "sem_unlink"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_util::unique_name;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_create_wait_post() {
        let sem = Semaphore::create(&unique_name("sem"), 1).expect("create");
        assert!(sem.is_creator());
        assert!(!sem.was_recovered());
        assert_eq!(sem.value().expect("value"), 1);

        sem.wait().expect("wait");
        assert_eq!(sem.value().expect("value"), 0);
        assert!(!sem.try_wait().expect("try_wait"));
        sem.post().expect("post");
        assert!(sem.try_wait().expect("try_wait"));
        sem.post().expect("post");
        assert_eq!(sem.last_known_value(), 0);
        assert_eq!(sem.value().expect("value"), 1);
    }

    #[test]
    fn test_second_instance_attaches() {
        let name = unique_name("sem_attach");
        let first = Semaphore::create(&name, 0).expect("create");
        let second = Semaphore::create(&name, 0).expect("attach");
        assert!(first.is_creator());
        assert!(!second.is_creator());

        first.post().expect("post");
        assert!(second.try_wait().expect("try_wait"));
    }

    #[test]
    fn test_stale_counter_is_reset() {
        let name = unique_name("sem_stale");
        let crashed = Semaphore::create(&name, 1).expect("create");
        for _ in 0..3 {
            crashed.post().expect("post");
        }
        assert_eq!(crashed.value().expect("value"), 4);
        // Leave the object behind without teardown, like a killed process.
        std::mem::forget(crashed);

        let sem = Semaphore::create(&name, 1).expect("recreate");
        assert!(sem.was_recovered());
        assert!(sem.is_creator());
        assert_eq!(sem.value().expect("value"), 1);

        sem.wait().expect("wait");
        assert!(!sem.try_wait().expect("try_wait"));
        sem.post().expect("post");
        assert_eq!(sem.value().expect("value"), 1);
    }

    #[test]
    fn test_limit_above_initial_value_is_not_stale() {
        let name = unique_name("sem_limit");
        let first = Semaphore::with_limit(&name, 0, 1, &ChannelConfig::default()).expect("create");
        first.post().expect("post");

        let second =
            Semaphore::with_limit(&name, 0, 1, &ChannelConfig::default()).expect("attach");
        assert!(!second.was_recovered());
        assert!(!second.is_creator());
        assert_eq!(second.max_value(), 1);
        assert!(second.try_wait().expect("try_wait"));
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn hold_and_bail(sem: &Semaphore) -> Result<()> {
            let _guard = sem.acquire()?;
            assert_eq!(sem.value()?, 0);
            Err(ShmError::Closed)
        }

        let sem = Semaphore::create(&unique_name("sem_guard"), 1).expect("create");
        assert!(hold_and_bail(&sem).is_err());
        assert_eq!(sem.value().expect("value"), 1);
    }

    #[test]
    fn test_guard_releases_on_unwind() {
        let sem = Semaphore::create(&unique_name("sem_unwind"), 1).expect("create");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = sem.acquire().expect("acquire");
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(sem.value().expect("value"), 1);
    }

    #[test]
    fn test_destroy_posts_to_release_waiter() {
        let name = unique_name("sem_destroy");
        let mut owner = Semaphore::create(&name, 0).expect("create");
        let waiter_sem = Arc::new(Semaphore::create(&name, 0).expect("attach"));
        let released = Arc::new(AtomicBool::new(false));

        let handle = {
            let waiter_sem = Arc::clone(&waiter_sem);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                waiter_sem.wait().expect("wait");
                released.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!released.load(Ordering::SeqCst));
        owner.destroy().expect("destroy");
        handle.join().expect("join");
        assert!(released.load(Ordering::SeqCst));

        owner.destroy().expect("second destroy is a no-op");
        assert!(!owner.is_open());
        assert!(matches!(owner.post(), Err(ShmError::Closed)));
    }

    #[test]
    fn test_attached_destroy_leaves_counter_alone() {
        let name = unique_name("sem_detach");
        let owner = Semaphore::create(&name, 1).expect("create");
        let mut peer = Semaphore::create(&name, 1).expect("attach");
        assert!(!peer.is_creator());

        peer.destroy().expect("destroy attached");
        assert_eq!(owner.value().expect("value"), 1);

        let again = Semaphore::create(&name, 1).expect("attach again");
        assert!(!again.was_recovered());
        assert!(!again.is_creator());
    }

    #[test]
    fn test_always_policy_posts_from_attached_instance() {
        let name = unique_name("sem_always");
        let config = ChannelConfig::new().with_unlink_policy(UnlinkPolicy::Always);
        let owner = Semaphore::with_config(&name, 0, &config).expect("create");
        let mut peer = Semaphore::with_config(&name, 0, &config).expect("attach");
        peer.destroy().expect("destroy attached");
        // The name is gone; the surviving handle saw the release post.
        assert!(owner.try_wait().expect("try_wait"));
        assert!(!Semaphore::unlink_name(&name).expect("unlink"));
    }

    #[test]
    fn test_destroy_frees_name() {
        let name = unique_name("sem_free");
        let mut sem = Semaphore::create(&name, 1).expect("create");
        sem.destroy().expect("destroy");
        assert!(!Semaphore::unlink_name(&name).expect("unlink"));

        let fresh = Semaphore::create(&name, 1).expect("recreate");
        assert!(fresh.is_creator());
        assert!(!fresh.was_recovered());
    }
}
