//! Mutex-Channel: semaphore-guarded segment with asynchronous snapshots.

use std::marker::PhantomData;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use super::{read_shared, write_shared};
use crate::Result;
use crate::config::ChannelConfig;
use crate::name::{MUTEX_SUFFIX, ObjectName};
use crate::payload::FlatPayload;
use crate::runner::{AsyncTaskRunner, Task};
use crate::segment::SharedSegment;
use crate::semaphore::Semaphore;
use crate::swapper::{DoubleBufferSwapper, Slot, Ticket};
use crate::teardown::{Release, Teardown};

/// Worker task: take the segment semaphore and swap the snapshot in.
struct SwapTask<T: FlatPayload> {
    channel: String,
    semaphore: Arc<Semaphore>,
    swapper: Arc<DoubleBufferSwapper<T>>,
}

impl<T: FlatPayload> Task for SwapTask<T> {
    fn run(&mut self) -> Result<()> {
        let _guard = self.semaphore.acquire()?;
        self.swapper.swap();
        Ok(())
    }

    fn on_error(&mut self, message: &str) {
        tracing::error!(channel = %self.channel, error = message, "snapshot swap failed");
    }
}

/// Zero-copy channel whose loads settle into private snapshots.
///
/// `store` takes the `<name>_sem` semaphore around the copy into the
/// segment. `load` never blocks: the returned [`LoadHandle`] first resolves
/// to the live segment and, once the background worker has run, to a
/// snapshot taken under the same semaphore.
pub struct MutexChannel<T: FlatPayload> {
    // Field order is drop order: the worker is joined before the swapper,
    // semaphore and segment it uses are released.
    runner: AsyncTaskRunner,
    swapper: Arc<DoubleBufferSwapper<T>>,
    semaphore: Arc<Semaphore>,
    segment: SharedSegment,
    snapshot_timeout: Duration,
    closed: bool,
}

impl<T: FlatPayload> MutexChannel<T> {
    /// Create or attach with the default configuration.
    pub fn create(name: &str) -> Result<Self> {
        Self::with_config(name, &ChannelConfig::default())
    }

    /// Create or attach the segment and its `<name>_sem` semaphore, then
    /// start the snapshot worker.
    #[allow(unsafe_code)]
    pub fn with_config(name: &str, config: &ChannelConfig) -> Result<Self> {
        let base = ObjectName::new(name)?;
        let segment = SharedSegment::with_config(base.as_str(), T::SIZE, config)?;
        let semaphore = Arc::new(Semaphore::with_config(
            base.with_suffix(MUTEX_SUFFIX)?.as_str(),
            1,
            config,
        )?);

        // SAFETY: the segment is owned by the channel and released only
        // after the worker holding the other swapper reference is joined.
        let swapper = Arc::new(unsafe { DoubleBufferSwapper::new(segment.typed_ptr::<T>()) });

        let mut runner = AsyncTaskRunner::new(
            config.worker_name.clone(),
            SwapTask {
                channel: base.to_string(),
                semaphore: Arc::clone(&semaphore),
                swapper: Arc::clone(&swapper),
            },
        );
        runner.async_start()?;

        tracing::debug!(channel = %base, size = T::SIZE, "opened mutex channel");
        Ok(Self {
            runner,
            swapper,
            semaphore,
            segment,
            snapshot_timeout: config.snapshot_timeout,
            closed: false,
        })
    }

    /// Copy `value` into the segment under the channel semaphore.
    #[allow(unsafe_code)]
    pub fn store(&self, value: &T) -> Result<()> {
        let _guard = self.semaphore.acquire()?;
        // SAFETY: the segment holds one `T` and the semaphore excludes other
        // writers and the snapshot worker.
        unsafe { write_shared(self.swapper.live_ptr(), value) };
        Ok(())
    }

    /// Select the live segment and schedule a snapshot swap.
    ///
    /// Returns immediately. The handle borrows the channel, so it stays
    /// valid until the next `load` or `close`.
    pub fn load(&mut self) -> LoadHandle<'_, T> {
        self.swapper.set_active(Slot::Live);
        let ticket = self.swapper.stage();
        if !self.runner.trigger_once() {
            tracing::warn!(channel = %self.segment.name(), "snapshot worker is stopped");
        }
        LoadHandle {
            swapper: &self.swapper,
            ticket,
            timeout: self.snapshot_timeout,
            _channel: PhantomData,
        }
    }

    /// Stop the worker, destroy the semaphore and destroy the segment.
    ///
    /// Waits for an in-flight swap to finish first. Every step runs even if
    /// an earlier one failed; the first failure is returned.
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

    /// Address of this instance's mapping of the segment.
    pub fn segment_ptr(&self) -> NonNull<T> {
        self.swapper.live_ptr()
    }

    /// Address of the private snapshot buffer.
    pub fn scratch_ptr(&self) -> NonNull<T> {
        self.swapper.scratch_ptr()
    }
}

impl<T: FlatPayload> Release for MutexChannel<T> {
    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let name = self.segment.name().clone();

        let result = Teardown::new(name.as_str())
            .step("stop worker", || self.runner.async_stop())
            .step("destroy semaphore", || match Arc::get_mut(&mut self.semaphore) {
                Some(semaphore) => semaphore.destroy(),
                // Still shared; released when the last reference drops.
                None => Ok(()),
            })
            .step("destroy segment", || self.segment.destroy())
            .finish();

        tracing::debug!(channel = %name, "closed mutex channel");
        result
    }
}

impl<T: FlatPayload> Drop for MutexChannel<T> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl<T: FlatPayload> std::fmt::Debug for MutexChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexChannel")
            .field("segment", &self.segment)
            .field("semaphore", &self.semaphore)
            .field("swapper", &self.swapper)
            .field("runner", &self.runner)
            .finish()
    }
}

/// Result of [`MutexChannel::load`].
///
/// Resolves to the live segment until the worker's swap for this load
/// completes, then to the channel's private snapshot.
pub struct LoadHandle<'a, T: FlatPayload> {
    swapper: &'a DoubleBufferSwapper<T>,
    ticket: Ticket,
    timeout: Duration,
    _channel: PhantomData<&'a mut MutexChannel<T>>,
}

impl<T: FlatPayload> LoadHandle<'_, T> {
    /// Slot the handle currently resolves to.
    pub fn slot(&self) -> Slot {
        self.swapper.active()
    }

    /// Address the handle currently resolves to.
    pub fn as_ptr(&self) -> *const T {
        self.swapper.target().as_ptr().cast_const()
    }

    /// Whether the snapshot for this load is in place.
    pub fn is_snapshot(&self) -> bool {
        self.swapper.is_settled(self.ticket) && self.slot() == Slot::Snapshot
    }

    /// Wait for the snapshot using the configured timeout.
    pub fn wait_snapshot(&self) -> bool {
        self.wait_snapshot_timeout(self.timeout)
    }

    /// Wait up to `timeout` for the snapshot of this load.
    pub fn wait_snapshot_timeout(&self, timeout: Duration) -> bool {
        self.swapper.wait_settled(self.ticket, timeout) && self.slot() == Slot::Snapshot
    }

    /// Read the current target.
    ///
    /// Before the snapshot is in place this reads live shared memory and
    /// may observe a concurrent store half-written.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.swapper.with(f)
    }

    /// Copy the current target into `dst`.
    #[allow(unsafe_code)]
    pub fn copy_into(&self, dst: &mut T) {
        match self.slot() {
            // SAFETY: the live pointer stays mapped while the channel is
            // borrowed by this handle.
            Slot::Live => unsafe { read_shared(self.swapper.live_ptr(), dst) },
            Slot::Snapshot => self.swapper.with(|snapshot| {
                bytemuck::bytes_of_mut(dst).copy_from_slice(bytemuck::bytes_of(snapshot));
            }),
        }
    }
}

impl<T: FlatPayload> std::fmt::Debug for LoadHandle<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadHandle")
            .field("slot", &self.slot())
            .field("ticket", &self.ticket)
            .finish()
    }
}
