//! Channel facades over a shared segment.
//!
//! Three access patterns share one segment layout per named channel:
//!
//! - [`MutexChannel`]: one semaphore guards the segment; `load` returns a
//!   zero-copy handle at once and a background worker later redirects it to
//!   a private snapshot.
//! - [`HandoffChannel`]: a write/read token pair enforces strict capacity-1
//!   alternation between producer and consumer.
//! - [`SeqLockChannel`]: a version counter in front of the payload lets
//!   readers retry torn copies without ever blocking on a semaphore.
//!
//! Each process opens its own instance of a channel by name. Instances of
//! different kinds must not be opened on the same name.

mod handoff;
mod mutex;
mod seqlock;

pub use handoff::HandoffChannel;
pub use mutex::{LoadHandle, MutexChannel};
pub use seqlock::SeqLockChannel;

use std::ptr::{self, NonNull};

use crate::payload::FlatPayload;

/// Copy `value` into shared memory at `dst`.
///
/// # Safety
///
/// `dst` must be valid for writes of one `T` and the caller must hold
/// whatever synchronization protects it.
#[allow(unsafe_code)]
unsafe fn write_shared<T: FlatPayload>(dst: NonNull<T>, value: &T) {
    // SAFETY: forwarded to the caller; `value` is a distinct local borrow.
    unsafe { ptr::copy_nonoverlapping(ptr::from_ref(value), dst.as_ptr(), 1) };
}

/// Copy one `T` out of shared memory into `dst`.
///
/// # Safety
///
/// `src` must be valid for reads of one `T`. Without synchronization the
/// copy may be torn; any bit pattern is still a valid `T`.
#[allow(unsafe_code)]
unsafe fn read_shared<T: FlatPayload>(src: NonNull<T>, dst: &mut T) {
    // SAFETY: forwarded to the caller; `dst` is a distinct exclusive borrow.
    unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr::from_mut(dst), 1) };
}
