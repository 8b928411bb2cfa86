//! Double-buffer indirection between a live region and a private snapshot.
//!
//! A reader resolves the current target through a [`Slot`] selector instead
//! of a raw pointer-to-pointer. Right after [`DoubleBufferSwapper::set_active`]
//! selects [`Slot::Live`], reads go straight to the shared segment. Once
//! [`DoubleBufferSwapper::swap`] has copied the staged source into the owned
//! scratch buffer, the selector flips to [`Slot::Snapshot`] and the same
//! reader sees a stable private copy.
//!
//! `swap` copies from the live region, so the caller must serialize it
//! against writers of that region (the Mutex-Channel holds the segment
//! semaphore around it).

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::payload::{FlatPayload, zeroed_box};

/// Which buffer the indirection currently resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Slot {
    /// The shared segment, continuously overwritten by producers.
    Live = 0,
    /// The private scratch buffer filled by the last swap.
    Snapshot = 1,
}

impl Slot {
    const fn from_word(word: u64) -> Self {
        if word & 1 == Self::Snapshot as u64 {
            Self::Snapshot
        } else {
            Self::Live
        }
    }
}

/// Selector word: a change counter in the upper bits, the slot in bit 0.
/// Every `set_active` produces a new word, so a swap can detect that the
/// selector moved while it was copying.
const fn next_word(word: u64, slot: Slot) -> u64 {
    ((word >> 1).wrapping_add(1) << 1) | slot as u64
}

/// Generation number returned by [`DoubleBufferSwapper::stage`].
pub type Ticket = u64;

/// Live/snapshot selector with an owned scratch buffer.
pub struct DoubleBufferSwapper<T: FlatPayload> {
    live: NonNull<T>,
    scratch: RwLock<Box<T>>,
    scratch_addr: NonNull<T>,
    selector: AtomicU64,
    staged: AtomicU64,
    /// Serializes swaps so `completed` is never held across the copy.
    swapping: Mutex<()>,
    completed: Mutex<Ticket>,
    settled: Condvar,
}

impl<T: FlatPayload> DoubleBufferSwapper<T> {
    /// Create a swapper over a live region.
    ///
    /// The selector starts on [`Slot::Live`] with nothing staged.
    ///
    /// # Safety
    ///
    /// `live` must point to a readable `T` for the whole lifetime of the
    /// swapper.
    #[allow(unsafe_code)]
    pub unsafe fn new(live: NonNull<T>) -> Self {
        let mut scratch = zeroed_box::<T>();
        let scratch_addr = NonNull::from(&mut *scratch);
        Self {
            live,
            scratch: RwLock::new(scratch),
            scratch_addr,
            selector: AtomicU64::new(Slot::Live as u64),
            staged: AtomicU64::new(0),
            swapping: Mutex::new(()),
            completed: Mutex::new(0),
            settled: Condvar::new(),
        }
    }

    /// Point the indirection at a slot.
    pub fn set_active(&self, slot: Slot) {
        let mut current = self.selector.load(Ordering::Acquire);
        while let Err(actual) = self.selector.compare_exchange_weak(
            current,
            next_word(current, slot),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            current = actual;
        }
    }

    /// Slot the indirection currently resolves to.
    pub fn active(&self) -> Slot {
        Slot::from_word(self.selector.load(Ordering::Acquire))
    }

    /// Record that the next [`swap`](Self::swap) should capture the live
    /// region. Does not move the selector.
    pub fn stage(&self) -> Ticket {
        self.staged.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Copy the staged live region into scratch and select the snapshot.
    ///
    /// Returns `false` when nothing new was staged since the last swap, in
    /// which case scratch and the selector are left untouched. If the
    /// selector was moved while copying, it is left where the caller put it;
    /// the stage that accompanies such a move schedules the next swap.
    #[allow(unsafe_code)]
    pub fn swap(&self) -> bool {
        let _swapping = self.swapping.lock();
        let ticket = self.staged.load(Ordering::Acquire);
        if ticket <= *self.completed.lock() {
            return false;
        }
        let observed = self.selector.load(Ordering::Acquire);

        {
            let mut scratch = self.scratch.write();
            let dst: *mut T = &mut **scratch;
            // SAFETY: `live` is valid per the constructor contract; scratch is
            // exclusively borrowed; the regions never overlap.
            unsafe { ptr::copy_nonoverlapping(self.live.as_ptr(), dst, 1) };
        }
        let redirected = self
            .selector
            .compare_exchange(
                observed,
                next_word(observed, Slot::Snapshot),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !redirected {
            tracing::trace!(generation = ticket, "selector moved during swap");
        }

        *self.completed.lock() = ticket;
        tracing::trace!(generation = ticket, "snapshot swapped in");
        self.settled.notify_all();
        true
    }

    /// Whether the swap for `ticket` (or a later one) has completed.
    pub fn is_settled(&self, ticket: Ticket) -> bool {
        *self.completed.lock() >= ticket
    }

    /// Block until the swap for `ticket` has completed or `timeout` elapses.
    pub fn wait_settled(&self, ticket: Ticket, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        while *completed < ticket {
            if self.settled.wait_until(&mut completed, deadline).timed_out() {
                return *completed >= ticket;
            }
        }
        true
    }

    /// Address of the live region.
    pub const fn live_ptr(&self) -> NonNull<T> {
        self.live
    }

    /// Address of the scratch buffer.
    pub const fn scratch_ptr(&self) -> NonNull<T> {
        self.scratch_addr
    }

    /// Address the indirection currently resolves to.
    pub fn target(&self) -> NonNull<T> {
        match self.active() {
            Slot::Live => self.live,
            Slot::Snapshot => self.scratch_addr,
        }
    }

    /// Read through the indirection.
    ///
    /// A live read is unsynchronized and may observe a write in progress
    /// from another process. A snapshot read holds the scratch lock so no
    /// swap rewrites it underneath `f`; a pending swap therefore cannot
    /// settle while `f` runs, and waiting for it from inside `f` only
    /// returns at the wait's timeout.
    #[allow(unsafe_code)]
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match self.active() {
            // SAFETY: `live` is valid per the constructor contract. Tearing is
            // the documented cost of the zero-copy path.
            Slot::Live => f(unsafe { self.live.as_ref() }),
            Slot::Snapshot => {
                let scratch = self.scratch.read();
                f(&scratch)
            }
        }
    }
}

impl<T: FlatPayload> std::fmt::Debug for DoubleBufferSwapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleBufferSwapper")
            .field("active", &self.active())
            .field("staged", &self.staged.load(Ordering::Relaxed))
            .field("completed", &*self.completed.lock())
            .finish_non_exhaustive()
    }
}

// SAFETY: `live` points into shared memory that outlives the swapper (see
// `new`), and every mutation of scratch happens under the RwLock.
#[allow(unsafe_code)]
unsafe impl<T: FlatPayload> Send for DoubleBufferSwapper<T> {}

// SAFETY: see `Send`.
#[allow(unsafe_code)]
unsafe impl<T: FlatPayload> Sync for DoubleBufferSwapper<T> {}

#[cfg(test)]
#[allow(clippy::expect_used, unsafe_code)]
mod tests {
    use super::*;

    fn swapper_over(live: &mut Box<[u32; 16]>) -> DoubleBufferSwapper<[u32; 16]> {
        // SAFETY: every test keeps `live` alive longer than the swapper.
        unsafe { DoubleBufferSwapper::new(NonNull::from(&mut **live)) }
    }

    #[test]
    fn test_starts_live() {
        let mut live = Box::new([7u32; 16]);
        let swapper = swapper_over(&mut live);
        assert_eq!(swapper.active(), Slot::Live);
        assert_eq!(swapper.target(), swapper.live_ptr());
        assert_eq!(swapper.with(|v| v[0]), 7);
    }

    #[test]
    fn test_stage_does_not_move_selector() {
        let mut live = Box::new([1u32; 16]);
        let swapper = swapper_over(&mut live);
        let ticket = swapper.stage();
        assert_eq!(ticket, 1);
        assert_eq!(swapper.active(), Slot::Live);
        assert!(!swapper.is_settled(ticket));
    }

    #[test]
    fn test_swap_captures_and_redirects() {
        let mut live = Box::new([1u32; 16]);
        let live_ptr = NonNull::from(&mut *live);
        let swapper = swapper_over(&mut live);

        let ticket = swapper.stage();
        assert!(swapper.swap());
        assert!(swapper.is_settled(ticket));
        assert_eq!(swapper.active(), Slot::Snapshot);
        assert_eq!(swapper.target(), swapper.scratch_ptr());

        // SAFETY: `live` is still allocated; nothing else reads it right now.
        unsafe { live_ptr.as_ptr().write([9u32; 16]) };
        assert_eq!(swapper.with(|v| v[3]), 1);

        swapper.set_active(Slot::Live);
        assert_eq!(swapper.with(|v| v[3]), 9);
    }

    #[test]
    fn test_swap_without_stage_is_noop() {
        let mut live = Box::new([5u32; 16]);
        let swapper = swapper_over(&mut live);
        assert!(!swapper.swap());
        assert_eq!(swapper.active(), Slot::Live);

        swapper.stage();
        assert!(swapper.swap());
        assert!(!swapper.swap(), "a second swap for the same stage copies nothing");
    }

    #[test]
    fn test_set_active_live_after_snapshot_and_restage() {
        let mut live = Box::new([2u32; 16]);
        let live_ptr = NonNull::from(&mut *live);
        let swapper = swapper_over(&mut live);

        swapper.stage();
        assert!(swapper.swap());
        swapper.set_active(Slot::Live);
        assert_eq!(swapper.target(), swapper.live_ptr());

        // SAFETY: `live` is still allocated; nothing else reads it right now.
        unsafe { live_ptr.as_ptr().write([3u32; 16]) };
        let ticket = swapper.stage();
        assert!(swapper.swap());
        assert!(swapper.is_settled(ticket));
        assert_eq!(swapper.active(), Slot::Snapshot);
        assert_eq!(swapper.with(|v| v[15]), 3);
    }

    #[test]
    fn test_wait_settled_times_out() {
        let mut live = Box::new([0u32; 16]);
        let swapper = swapper_over(&mut live);
        let ticket = swapper.stage();
        assert!(!swapper.wait_settled(ticket, Duration::from_millis(20)));
        swapper.swap();
        assert!(swapper.wait_settled(ticket, Duration::from_millis(20)));
    }

    #[test]
    fn test_settle_queries_inside_reader_do_not_block() {
        let mut live = Box::new([1u32; 16]);
        let swapper = swapper_over(&mut live);
        let first = swapper.stage();
        assert!(swapper.swap());

        let second = swapper.stage();
        std::thread::scope(|scope| {
            swapper.with(|snapshot| {
                let pending = scope.spawn(|| swapper.swap());
                // Let the swap reach the scratch lock held by this reader.
                std::thread::sleep(Duration::from_millis(30));
                assert!(swapper.is_settled(first));
                assert!(!swapper.is_settled(second));
                assert!(!swapper.wait_settled(second, Duration::from_millis(10)));
                assert_eq!(snapshot[0], 1);
                pending
            })
            .join()
            .expect("swap thread");
        });
        assert!(swapper.is_settled(second));
    }
}
