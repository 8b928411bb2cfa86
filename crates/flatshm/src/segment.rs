//! Named shared memory segments.
//!
//! A segment is a POSIX shared memory object (`shm_open`) resized to an
//! exact byte count and mapped read/write with `memmap2`. Several
//! processes can each own an independent [`SharedSegment`] for the same
//! name; each instance has exactly one mapping.

use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use libc::{O_CREAT, O_EXCL, O_RDWR, c_uint, mode_t};
use memmap2::{MmapMut, MmapOptions};

use crate::config::ChannelConfig;
use crate::error::ShmError;
use crate::name::ObjectName;
use crate::payload::FlatPayload;
use crate::teardown::{Release, Teardown};
use crate::{Result, UnlinkPolicy};

/// Mount point where `shm_open` objects appear as files.
pub const SHM_MOUNT: &str = "/dev/shm";

/// A mapped, fixed-size shared memory region.
pub struct SharedSegment {
    name: ObjectName,
    path: PathBuf,
    size: usize,
    /// Start of the mapping, captured once so `&self` can hand out pointers.
    base: NonNull<u8>,
    map: Option<MmapMut>,
    file: Option<File>,
    creator: bool,
    unlink_policy: UnlinkPolicy,
    unlinked: bool,
}

impl SharedSegment {
    /// Open or create a segment with the default configuration.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::with_config(name, size, &ChannelConfig::default())
    }

    /// Open or create a segment, set its size to exactly `size` bytes and
    /// map it read/write.
    ///
    /// On failure nothing stays allocated: the descriptor is closed and a
    /// newly created object is unlinked again.
    #[allow(unsafe_code)]
    pub fn with_config(name: &str, size: usize, config: &ChannelConfig) -> Result<Self> {
        let name = ObjectName::new(name)?;
        if size == 0 {
            return Err(ShmError::Resource {
                name: name.to_string(),
                op: "ftruncate",
                source: io::Error::new(io::ErrorKind::InvalidInput, "segment size must be non-zero"),
            });
        }

        let (fd, creator) = open_or_create(&name, config.mode)?;
        // From here on, dropping `file` closes the descriptor.
        let file = File::from(fd);

        let rollback = |err: ShmError| {
            if creator {
                let _ = unlink(&name);
            }
            err
        };

        let len = u64::try_from(size).unwrap_or(u64::MAX);
        if let Err(source) = file.set_len(len) {
            return Err(rollback(ShmError::Resource {
                name: name.to_string(),
                op: "ftruncate",
                source,
            }));
        }

        // SAFETY: the object was just resized to `size` bytes. Other
        // processes may mutate the bytes concurrently; every access goes
        // through raw pointers under the channel's synchronization.
        let mut map = match unsafe { MmapOptions::new().len(size).map_mut(&file) } {
            Ok(map) => map,
            Err(source) => {
                return Err(rollback(ShmError::Resource {
                    name: name.to_string(),
                    op: "mmap",
                    source,
                }));
            }
        };

        let Some(base) = NonNull::new(map.as_mut_ptr()) else {
            return Err(rollback(ShmError::Resource {
                name: name.to_string(),
                op: "mmap",
                source: io::Error::other("mapping returned a null pointer"),
            }));
        };

        tracing::debug!(
            name = %name,
            size,
            creator,
            "{} shared memory segment",
            if creator { "created" } else { "attached" }
        );

        Ok(Self {
            path: Path::new(SHM_MOUNT).join(name.component()),
            name,
            size,
            base,
            map: Some(map),
            file: Some(file),
            creator,
            unlink_policy: config.unlink_policy,
            unlinked: false,
        })
    }

    /// Remove a segment name without opening it.
    ///
    /// Returns `Ok(false)` if no object with that name existed.
    pub fn unlink_name(name: &str) -> Result<bool> {
        let name = ObjectName::new(name)?;
        match unlink(&name) {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Start of the mapped region.
    ///
    /// Valid for `size()` bytes until the segment is destroyed.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Start of the mapped region as a payload pointer.
    ///
    /// The mapping is page aligned, which satisfies any payload alignment.
    pub fn typed_ptr<T: FlatPayload>(&self) -> NonNull<T> {
        assert!(
            T::SIZE <= self.size,
            "payload of {} bytes does not fit segment of {} bytes",
            T::SIZE,
            self.size
        );
        assert!(self.base.as_ptr().align_offset(align_of::<T>()) == 0);
        self.base.cast::<T>()
    }

    /// Size of the region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Filesystem path where the object is visible.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// POSIX object name.
    pub const fn name(&self) -> &ObjectName {
        &self.name
    }

    /// Whether this instance created the backing object.
    pub const fn is_creator(&self) -> bool {
        self.creator
    }

    /// Whether the region is still mapped.
    pub const fn is_mapped(&self) -> bool {
        self.map.is_some()
    }

    /// Unmap, close and (depending on the unlink policy) unlink.
    ///
    /// Each step runs even if an earlier one failed; repeated calls are
    /// no-ops.
    pub fn destroy(&mut self) -> Result<()> {
        self.release()
    }
}

impl Release for SharedSegment {
    fn release(&mut self) -> Result<()> {
        let should_unlink =
            !self.unlinked && self.unlink_policy.should_unlink(self.creator);
        let name = self.name.clone();

        let result = Teardown::new(self.name.as_str())
            .step("munmap", || {
                drop(self.map.take());
                Ok(())
            })
            .step("close", || {
                drop(self.file.take());
                Ok(())
            })
            .step("shm_unlink", || {
                if !should_unlink {
                    return Ok(());
                }
                match unlink(&name) {
                    Err(err) if err.is_not_found() => Ok(()),
                    other => other,
                }
            })
            .finish();

        if should_unlink {
            self.unlinked = true;
        }
        result
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name.as_str())
            .field("path", &self.path)
            .field("size", &self.size)
            .field("creator", &self.creator)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

// SAFETY: the fd and mapping are owned by this instance; `base` points into
// OS-managed shared memory that stays mapped while `map` is Some. Concurrent
// access to the bytes is synchronized by the channels built on top.
#[allow(unsafe_code)]
unsafe impl Send for SharedSegment {}

// SAFETY: see `Send`; `&self` methods only hand out raw pointers.
#[allow(unsafe_code)]
unsafe impl Sync for SharedSegment {}

/// Exclusive create, falling back to attach on `EEXIST`.
#[allow(unsafe_code)]
fn open_or_create(name: &ObjectName, mode: u32) -> Result<(OwnedFd, bool)> {
    let c_name: &CStr = name.as_c_str();
    let mode = mode as mode_t;

    // SAFETY: c_name is a valid NUL-terminated string.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), O_CREAT | O_EXCL | O_RDWR, mode as c_uint) };
    if fd >= 0 {
        // SAFETY: shm_open returned a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // umask may have narrowed the requested bits.
        // SAFETY: fd is open for the duration of the call.
        if unsafe { libc::fchmod(std::os::fd::AsRawFd::as_raw_fd(&fd), mode) } == -1 {
            let err = ShmError::resource(name.as_str(), "fchmod");
            drop(fd);
            let _ = unlink(name);
            return Err(err);
        }
        return Ok((fd, true));
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EEXIST) {
        return Err(ShmError::Resource {
            name: name.to_string(),
            op: "shm_open",
            source: err,
        });
    }

    // SAFETY: as above.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), O_RDWR, mode as c_uint) };
    if fd < 0 {
        return Err(ShmError::resource(name.as_str(), "shm_open"));
    }
    // SAFETY: shm_open returned a fresh descriptor we now own.
    Ok((unsafe { OwnedFd::from_raw_fd(fd) }, false))
}

#[allow(unsafe_code)]
fn unlink(name: &ObjectName) -> Result<()> {
    // SAFETY: valid NUL-terminated name.
    if unsafe { libc::shm_unlink(name.as_c_str().as_ptr()) } == -1 {
        return Err(ShmError::resource(name.as_str(), "shm_unlink"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, unsafe_code)]
mod tests {
    use super::*;
    use crate::test_util::unique_name;

    #[test]
    fn test_create_write_read() {
        let name = unique_name("seg");
        let segment = SharedSegment::create(&name, 4096).expect("create");
        assert_eq!(segment.size(), 4096);
        assert!(segment.is_creator());
        assert_eq!(segment.path(), Path::new(SHM_MOUNT).join(&name));
        let metadata = std::fs::metadata(segment.path()).expect("backing file");
        assert_eq!(metadata.len(), 4096);

        // SAFETY: offsets are within the 4096 byte mapping.
        unsafe {
            *segment.as_ptr() = 0x42;
            *segment.as_ptr().add(4095) = 0xFF;
            assert_eq!(*segment.as_ptr(), 0x42);
            assert_eq!(*segment.as_ptr().add(4095), 0xFF);
        }
    }

    #[test]
    fn test_second_instance_attaches_to_same_bytes() {
        let name = unique_name("seg_attach");
        let first = SharedSegment::create(&name, 64).expect("create");
        let second = SharedSegment::create(&name, 64).expect("attach");
        assert!(first.is_creator());
        assert!(!second.is_creator());
        assert_ne!(first.as_ptr(), second.as_ptr());

        // SAFETY: both mappings are 64 bytes long.
        unsafe {
            *first.as_ptr().add(10) = 7;
            assert_eq!(*second.as_ptr().add(10), 7);
        }
    }

    #[test]
    fn test_destroy_is_idempotent_and_frees_name() {
        let name = unique_name("seg_destroy");
        let mut segment = SharedSegment::create(&name, 128).expect("create");
        segment.destroy().expect("destroy");
        assert!(!segment.is_mapped());
        segment.destroy().expect("second destroy");

        // Name is free again: the next instance is the creator.
        let fresh = SharedSegment::create(&name, 128).expect("recreate");
        assert!(fresh.is_creator());
    }

    #[test]
    fn test_attached_instance_does_not_unlink_by_default() {
        let name = unique_name("seg_policy");
        let creator = SharedSegment::create(&name, 32).expect("create");
        let mut attached = SharedSegment::create(&name, 32).expect("attach");
        attached.destroy().expect("destroy attached");

        let again = SharedSegment::create(&name, 32).expect("attach again");
        assert!(!again.is_creator());
        drop(again);
        drop(creator);
        assert!(!SharedSegment::unlink_name(&name).expect("unlink"));
    }

    #[test]
    fn test_always_policy_unlinks_from_any_instance() {
        let name = unique_name("seg_always");
        let config = ChannelConfig::new().with_unlink_policy(UnlinkPolicy::Always);
        let _creator = SharedSegment::with_config(&name, 32, &config).expect("create");
        let mut attached = SharedSegment::with_config(&name, 32, &config).expect("attach");
        attached.destroy().expect("destroy attached");

        let fresh = SharedSegment::with_config(&name, 32, &config).expect("recreate");
        assert!(fresh.is_creator());
    }

    #[test]
    fn test_zero_size_rejected_without_leftovers() {
        let name = unique_name("seg_zero");
        let err = SharedSegment::create(&name, 0).expect_err("zero size");
        assert!(matches!(err, ShmError::Resource { op: "ftruncate", .. }));
        assert!(!SharedSegment::unlink_name(&name).expect("unlink"));
    }

    #[test]
    fn test_typed_ptr() {
        let name = unique_name("seg_typed");
        let segment = SharedSegment::create(&name, 16).expect("create");
        let ptr = segment.typed_ptr::<[u64; 2]>();
        // SAFETY: the segment holds exactly one [u64; 2].
        unsafe {
            ptr.as_ptr().write([1, 2]);
            assert_eq!(*segment.as_ptr().cast::<u64>().add(1), 2);
        }
    }

    #[test]
    fn test_invalid_name() {
        assert!(matches!(
            SharedSegment::create("a/b", 16),
            Err(ShmError::InvalidName(_))
        ));
    }
}
