//! SeqLock-Channel: non-blocking torn-free reads.
//!
//! Segment layout (`<name>_seq`):
//!
//! ```text
//! +--------------+-----------------------+
//! | seq: u64     | payload: T            |
//! +--------------+-----------------------+
//! ```
//!
//! An odd `seq` means a write is in progress. Writers claim the lock with a
//! compare-and-swap from even to odd, so several writers (in any process)
//! serialize on it. Readers copy the payload and retry when `seq` was odd
//! or moved during the copy.

use std::hint;
use std::thread;
use std::marker::PhantomData;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicU64, Ordering};

use crate::Result;
use crate::config::ChannelConfig;
use crate::name::{ObjectName, SEQLOCK_SUFFIX};
use crate::payload::FlatPayload;
use crate::segment::SharedSegment;
use crate::teardown::Release;

/// Spins briefly, then yields the CPU between retries.
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    const fn new() -> Self {
        Self { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }
}

#[repr(C)]
struct SeqLayout<T> {
    seq: AtomicU64,
    payload: T,
}

/// Sequence-locked channel; neither `store` nor `load_into` touches a
/// semaphore.
///
/// There is no recovery for a writer that dies mid-store: the counter stays
/// odd and every later `store` and `load_into` on the name waits forever
/// (yielding, not spinning hot). Unlink the `<name>_seq` segment, for
/// example with `flatshm cleanup --kind seqlock`, to start over.
pub struct SeqLockChannel<T: FlatPayload> {
    segment: SharedSegment,
    layout: NonNull<SeqLayout<T>>,
    _payload: PhantomData<T>,
}

impl<T: FlatPayload> SeqLockChannel<T> {
    /// Create or attach with the default configuration.
    pub fn create(name: &str) -> Result<Self> {
        Self::with_config(name, &ChannelConfig::default())
    }

    /// Create or attach the `<name>_seq` segment.
    ///
    /// A fresh segment is zero-filled, which is an even (unlocked) counter
    /// and an all-zero payload.
    pub fn with_config(name: &str, config: &ChannelConfig) -> Result<Self> {
        let base = ObjectName::new(name)?;
        let segment = SharedSegment::with_config(
            base.with_suffix(SEQLOCK_SUFFIX)?.as_str(),
            size_of::<SeqLayout<T>>(),
            config,
        )?;

        let layout = segment.typed_ptr::<u8>().cast::<SeqLayout<T>>();
        debug_assert_eq!(layout.as_ptr().align_offset(align_of::<SeqLayout<T>>()), 0);

        tracing::debug!(channel = %base, size = T::SIZE, "opened seqlock channel");
        Ok(Self {
            segment,
            layout,
            _payload: PhantomData,
        })
    }

    #[allow(unsafe_code)]
    fn seq(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page aligned and at least one `SeqLayout<T>`
        // long; the counter is only ever accessed atomically.
        unsafe { &(*self.layout.as_ptr()).seq }
    }

    #[allow(unsafe_code)]
    fn payload_ptr(&self) -> *mut T {
        // SAFETY: in bounds of the mapping, see `seq`.
        unsafe { &raw mut (*self.layout.as_ptr()).payload }
    }

    /// Publish `value`.
    ///
    /// Spins while another writer holds the counter odd.
    #[allow(unsafe_code)]
    pub fn store(&self, value: &T) {
        let seq = self.seq();
        let mut backoff = Backoff::new();
        let mut current = seq.load(Ordering::Relaxed);
        loop {
            if current & 1 == 1 {
                backoff.snooze();
                current = seq.load(Ordering::Relaxed);
                continue;
            }
            match seq.compare_exchange_weak(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        // Odd counter must be visible before any payload byte changes.
        atomic::fence(Ordering::Release);

        // SAFETY: the odd counter excludes other writers; readers discard
        // whatever they copy while it is odd.
        unsafe { ptr::copy_nonoverlapping(ptr::from_ref(value), self.payload_ptr(), 1) };

        seq.store(current.wrapping_add(2), Ordering::Release);
    }

    /// Copy the latest complete value into `dst`, retrying torn copies.
    #[allow(unsafe_code)]
    pub fn load_into(&self, dst: &mut T) {
        let seq = self.seq();
        let mut backoff = Backoff::new();
        loop {
            let before = seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                backoff.snooze();
                continue;
            }

            // SAFETY: in-bounds copy; a torn result is discarded below and
            // every bit pattern is a valid `T`.
            unsafe { ptr::copy_nonoverlapping(self.payload_ptr(), ptr::from_mut(dst), 1) };

            atomic::fence(Ordering::Acquire);
            if seq.load(Ordering::Relaxed) == before {
                return;
            }
            backoff.snooze();
        }
    }

    /// Current counter value; even when no write is in progress.
    pub fn version(&self) -> u64 {
        self.seq().load(Ordering::Acquire)
    }

    /// Unmap and (per unlink policy) remove the segment.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    /// Size of the segment in bytes, counter included.
    pub const fn size(&self) -> usize {
        self.segment.size()
    }

    /// Filesystem path of the segment.
    pub fn path(&self) -> &Path {
        self.segment.path()
    }
}

impl<T: FlatPayload> Release for SeqLockChannel<T> {
    fn release(&mut self) -> Result<()> {
        if !self.segment.is_mapped() {
            return Ok(());
        }
        let result = self.segment.destroy();
        tracing::debug!(channel = %self.segment.name(), "closed seqlock channel");
        result
    }
}

impl<T: FlatPayload> std::fmt::Debug for SeqLockChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeqLockChannel")
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}

// SAFETY: `layout` points into the segment owned by this channel; all
// shared access goes through the sequence counter protocol.
#[allow(unsafe_code)]
unsafe impl<T: FlatPayload> Send for SeqLockChannel<T> {}

// SAFETY: see `Send`.
#[allow(unsafe_code)]
unsafe impl<T: FlatPayload> Sync for SeqLockChannel<T> {}
