//! Handoff-Channel: capacity-1 producer/consumer exchange.

use std::marker::PhantomData;
use std::path::Path;
use std::ptr::NonNull;

use super::{read_shared, write_shared};
use crate::Result;
use crate::config::ChannelConfig;
use crate::name::{ObjectName, READ_SUFFIX, WRITE_SUFFIX};
use crate::payload::FlatPayload;
use crate::segment::SharedSegment;
use crate::semaphore::Semaphore;
use crate::teardown::{Release, Teardown};

/// Strict hand-off of one value at a time.
///
/// `<name>_write` (initially 1) grants the producer the segment,
/// `<name>_read` (initially 0) grants it to the consumer. A second
/// `produce` blocks until the previous value has been consumed.
pub struct HandoffChannel<T: FlatPayload> {
    read_token: Semaphore,
    write_token: Semaphore,
    segment: SharedSegment,
    closed: bool,
    _payload: PhantomData<T>,
}

impl<T: FlatPayload> HandoffChannel<T> {
    /// Create or attach with the default configuration.
    pub fn create(name: &str) -> Result<Self> {
        Self::with_config(name, &ChannelConfig::default())
    }

    /// Create or attach the segment and both token semaphores.
    pub fn with_config(name: &str, config: &ChannelConfig) -> Result<Self> {
        let base = ObjectName::new(name)?;
        let segment = SharedSegment::with_config(base.as_str(), T::SIZE, config)?;
        let write_token = Semaphore::with_config(base.with_suffix(WRITE_SUFFIX)?.as_str(), 1, config)?;
        // Holds 1 while a value is buffered.
        let read_token =
            Semaphore::with_limit(base.with_suffix(READ_SUFFIX)?.as_str(), 0, 1, config)?;

        tracing::debug!(channel = %base, size = T::SIZE, "opened handoff channel");
        Ok(Self {
            read_token,
            write_token,
            segment,
            closed: false,
            _payload: PhantomData,
        })
    }

    fn payload_ptr(&self) -> NonNull<T> {
        self.segment.typed_ptr::<T>()
    }

    /// Wait for the write token, copy `value` in and hand it to a consumer.
    #[allow(unsafe_code)]
    pub fn produce(&self, value: &T) -> Result<()> {
        self.write_token.wait()?;
        // SAFETY: holding the write token grants exclusive access to the
        // segment, which holds one `T`.
        unsafe { write_shared(self.payload_ptr(), value) };
        self.read_token.post()
    }

    /// Wait for a value and pass it to `f` while still holding the segment.
    ///
    /// The write token is returned after `f`, also if `f` panics.
    #[allow(unsafe_code)]
    pub fn consume<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.read_token.wait()?;
        let token = ReturnToken::new(&self.write_token);
        // SAFETY: holding the read token grants exclusive access to the
        // segment until the write token is posted.
        let result = f(unsafe { self.payload_ptr().as_ref() });
        token.finish()?;
        Ok(result)
    }

    /// Wait for a value and copy it into `dst`.
    #[allow(unsafe_code)]
    pub fn consume_into(&self, dst: &mut T) -> Result<()> {
        self.read_token.wait()?;
        // SAFETY: see `consume`.
        unsafe { read_shared(self.payload_ptr(), dst) };
        self.write_token.post()
    }

    /// Copy a buffered value into `dst` without blocking.
    ///
    /// Returns `Ok(false)` when no value is waiting.
    #[allow(unsafe_code)]
    pub fn try_consume_into(&self, dst: &mut T) -> Result<bool> {
        if !self.read_token.try_wait()? {
            return Ok(false);
        }
        // SAFETY: see `consume`.
        unsafe { read_shared(self.payload_ptr(), dst) };
        self.write_token.post()?;
        Ok(true)
    }

    /// Destroy both tokens, then the segment.
    ///
    /// Destroying a token posts it once, so a peer blocked in `produce` or
    /// `consume` is released.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Size of the segment in bytes.
    pub const fn size(&self) -> usize {
        self.segment.size()
    }

    /// Filesystem path of the segment.
    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    /// POSIX name of the segment.
    pub const fn name(&self) -> &ObjectName {
        self.segment.name()
    }
}

impl<T: FlatPayload> Release for HandoffChannel<T> {
    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let name = self.segment.name().clone();

        let result = Teardown::new(name.as_str())
            .step("destroy read token", || self.read_token.destroy())
            .step("destroy write token", || self.write_token.destroy())
            .step("destroy segment", || self.segment.destroy())
            .finish();

        tracing::debug!(channel = %name, "closed handoff channel");
        result
    }
}

impl<T: FlatPayload> Drop for HandoffChannel<T> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl<T: FlatPayload> std::fmt::Debug for HandoffChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffChannel")
            .field("segment", &self.segment)
            .field("read_token", &self.read_token)
            .field("write_token", &self.write_token)
            .finish()
    }
}

/// Posts the write token when dropped unless `finish` already did.
struct ReturnToken<'a> {
    token: Option<&'a Semaphore>,
}

impl<'a> ReturnToken<'a> {
    const fn new(token: &'a Semaphore) -> Self {
        Self { token: Some(token) }
    }

    fn finish(mut self) -> Result<()> {
        match self.token.take() {
            Some(token) => token.post(),
            None => Ok(()),
        }
    }
}

impl Drop for ReturnToken<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take()
            && let Err(err) = token.post()
        {
            tracing::warn!(name = %token.name(), error = %err, "failed to return write token");
        }
    }
}
