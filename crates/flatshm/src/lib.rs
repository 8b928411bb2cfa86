//! Cross-process transport for flat payloads over POSIX shared memory.
//!
//! A producer writes fixed-size, pointer-free values (see [`FlatPayload`])
//! into a named shared segment; consumers in other processes read them
//! through one of three channel kinds:
//!
//! - **[`MutexChannel`]**: `load` returns immediately with a zero-copy
//!   handle on the live segment. A background worker then takes the
//!   segment semaphore, copies the value into a private buffer and
//!   redirects the same handle to that stable snapshot.
//! - **[`HandoffChannel`]**: a write-token/read-token semaphore pair gives
//!   strict capacity-1 alternation; every produced value is consumed
//!   exactly once.
//! - **[`SeqLockChannel`]**: a sequence counter in front of the payload
//!   lets readers copy without blocking and retry torn copies.
//!
//! The building blocks ([`SharedSegment`], [`Semaphore`],
//! [`DoubleBufferSwapper`], [`AsyncTaskRunner`]) are public as well.
//! Named semaphores left behind by a crashed process are detected on
//! attach and recreated.
//!
//! # Example
//!
//! ```rust,no_run
//! use flatshm::{HandoffChannel, MutexChannel};
//!
//! # fn example() -> flatshm::Result<()> {
//! let producer = HandoffChannel::<[u64; 4]>::create("telemetry")?;
//! producer.produce(&[1, 2, 3, 4])?;
//!
//! let consumer = HandoffChannel::<[u64; 4]>::create("telemetry")?;
//! let sum: u64 = consumer.consume(|value| value.iter().sum())?;
//! assert_eq!(sum, 10);
//!
//! let mut frames = MutexChannel::<[u8; 64]>::create("frames")?;
//! frames.store(&[7; 64])?;
//! let handle = frames.load();
//! if handle.wait_snapshot() {
//!     handle.with(|frame| assert_eq!(frame[0], 7));
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

// Error types
pub mod error;

// Configuration
pub mod config;

// Payload constraint and frame types
pub mod image;
pub mod payload;

// Object naming
pub mod name;

// Best-effort resource release
pub mod teardown;

// OS objects
#[cfg(unix)]
pub mod segment;
#[cfg(unix)]
pub mod semaphore;

// Double buffering and the background worker
pub mod runner;
pub mod swapper;

// Channel facades
#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod flat;

pub use config::{ChannelConfig, UnlinkPolicy};
pub use error::{Result, ShmError};
pub use image::{Image4kRgb, ImageType};
pub use payload::FlatPayload;
pub use runner::{AsyncTaskRunner, Task};
pub use swapper::{DoubleBufferSwapper, Slot, Ticket};

#[cfg(unix)]
pub use channel::{HandoffChannel, LoadHandle, MutexChannel, SeqLockChannel};
#[cfg(unix)]
pub use flat::FlatSharedMemory;
#[cfg(unix)]
pub use segment::SharedSegment;
#[cfg(unix)]
pub use semaphore::{Semaphore, SemaphoreGuard};
