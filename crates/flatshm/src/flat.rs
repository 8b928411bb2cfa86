//! Typed view of a single shared segment, without synchronization.

use std::marker::PhantomData;
use std::path::Path;
use std::ptr::{self, NonNull};

use crate::Result;
use crate::config::ChannelConfig;
use crate::payload::FlatPayload;
use crate::segment::SharedSegment;

/// A segment sized for exactly one `T`.
///
/// Readers and writers in other processes are not excluded; use a channel
/// when access must be coordinated.
pub struct FlatSharedMemory<T: FlatPayload> {
    segment: SharedSegment,
    _payload: PhantomData<T>,
}

impl<T: FlatPayload> FlatSharedMemory<T> {
    /// Create or attach `name` with the default configuration.
    pub fn create(name: &str) -> Result<Self> {
        Self::with_config(name, &ChannelConfig::default())
    }

    /// Create or attach `name` sized for one `T`.
    pub fn with_config(name: &str, config: &ChannelConfig) -> Result<Self> {
        Ok(Self {
            segment: SharedSegment::with_config(name, T::SIZE, config)?,
            _payload: PhantomData,
        })
    }

    /// Pointer to the mapped value.
    pub fn as_ptr(&self) -> NonNull<T> {
        self.segment.typed_ptr::<T>()
    }

    /// Borrow the mapped value.
    ///
    /// # Safety
    ///
    /// No other process or instance may write the segment while the
    /// reference is alive.
    #[allow(unsafe_code)]
    pub unsafe fn get(&self) -> &T {
        // SAFETY: mapped, aligned and sized for `T`; exclusion is the
        // caller's obligation.
        unsafe { self.as_ptr().as_ref() }
    }

    /// Mutably borrow the mapped value.
    ///
    /// # Safety
    ///
    /// No other process or instance may read or write the segment while the
    /// reference is alive.
    #[allow(unsafe_code)]
    pub unsafe fn get_mut(&mut self) -> &mut T {
        // SAFETY: see `get`.
        unsafe { self.as_ptr().as_mut() }
    }

    /// Copy the mapped value into `dst`. May observe a concurrent write
    /// half-done.
    #[allow(unsafe_code)]
    pub fn read_into(&self, dst: &mut T) {
        // SAFETY: in-bounds copy; any bit pattern is a valid `T`.
        unsafe { ptr::copy_nonoverlapping(self.as_ptr().as_ptr(), ptr::from_mut(dst), 1) };
    }

    /// Overwrite the mapped value.
    #[allow(unsafe_code)]
    pub fn write(&self, value: &T) {
        // SAFETY: in-bounds copy into the mapping.
        unsafe { ptr::copy_nonoverlapping(ptr::from_ref(value), self.as_ptr().as_ptr(), 1) };
    }

    /// Size of the segment in bytes.
    pub const fn size(&self) -> usize {
        self.segment.size()
    }

    /// Filesystem path of the segment.
    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    /// Unmap and (per unlink policy) remove the segment.
    pub fn destroy(&mut self) -> Result<()> {
        self.segment.destroy()
    }
}

impl<T: FlatPayload> std::fmt::Debug for FlatSharedMemory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FlatSharedMemory").field(&self.segment).finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, unsafe_code)]
mod tests {
    use super::*;
    use crate::test_util::unique_name;
    use bytemuck::{Pod, Zeroable};
    use pretty_assertions::assert_eq;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    struct Telemetry {
        sequence: u64,
        position: [f32; 3],
        flags: u32,
    }

    #[test]
    fn test_typed_access() {
        let name = unique_name("flat");
        let mut shm = FlatSharedMemory::<Telemetry>::create(&name).expect("create");
        assert_eq!(shm.size(), size_of::<Telemetry>());
        assert_eq!(shm.path(), Path::new("/dev/shm").join(&name));

        // SAFETY: no other instance exists yet.
        unsafe {
            assert_eq!(shm.get().sequence, 0);
            shm.get_mut().sequence = 42;
        }

        let other = FlatSharedMemory::<Telemetry>::create(&name).expect("attach");
        let mut copy = Telemetry::zeroed();
        other.read_into(&mut copy);
        assert_eq!(copy.sequence, 42);

        let value = Telemetry {
            sequence: 7,
            position: [1.0, 2.0, 3.0],
            flags: 1,
        };
        other.write(&value);
        // SAFETY: the writes above have completed; nothing writes concurrently.
        assert_eq!(unsafe { *shm.get() }, value);
    }

    #[test]
    fn test_path_is_backing_file() {
        let name = unique_name("flat_path");
        let mut shm = FlatSharedMemory::<Telemetry>::create(&name).expect("create");
        let path = shm.path().to_path_buf();
        let metadata = std::fs::metadata(&path).expect("backing file exists");
        assert_eq!(metadata.len(), size_of::<Telemetry>() as u64);

        shm.destroy().expect("destroy");
        assert!(!path.exists());
    }
}
