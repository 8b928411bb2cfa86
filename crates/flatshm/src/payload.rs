//! Flat payload constraint.
//!
//! A payload travels through shared memory as raw bytes, so it must be
//! fixed-size, contain no pointers or owning handles, have no padding and
//! accept the all-zero bit pattern. `bytemuck::Pod` states exactly that,
//! so every `Pod` type is a [`FlatPayload`].

use bytemuck::Pod;

/// A value that can be copied byte-for-byte between address spaces.
///
/// Every process attaching to the same named channel must use a type with
/// the same `size_of`.
pub trait FlatPayload: Pod + Send + Sync {
    /// Size of the payload in bytes.
    const SIZE: usize = size_of::<Self>();
}

impl<T: Pod + Send + Sync> FlatPayload for T {}

/// Allocate a zeroed payload directly on the heap.
///
/// Large payloads (a 4K frame is ~24 MiB) do not fit on a thread stack,
/// so `Box::new(T::zeroed())` is not an option.
pub fn zeroed_box<T: FlatPayload>() -> Box<T> {
    bytemuck::allocation::zeroed_box::<T>()
}

/// View a payload as its raw bytes.
pub fn as_bytes<T: FlatPayload>(value: &T) -> &[u8] {
    bytemuck::bytes_of(value)
}
