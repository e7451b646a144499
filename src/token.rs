//! The shared IO token counter (`spec.md` §3 "IO token").

use std::sync::atomic::{AtomicU64, Ordering};

/// A single shared 64-bit counter, reserved `lba_count` at a time by write
/// submissions so that successive writes to the same LBA, from any process,
/// carry distinguishable payloads (`spec.md` §8 invariant 3: token
/// monotonicity).
///
/// This lives in shared memory in a multi-process run: callers construct it
/// over a region obtained from [`crate::transport::SharedMemoryZone`].
pub struct IoToken {
    counter: *const AtomicU64,
}

// SAFETY: `IoToken` only ever hands out atomic operations on the pointee;
// the pointee is expected to live in shared memory that outlives every
// process using it.
unsafe impl Send for IoToken {}
unsafe impl Sync for IoToken {}

impl IoToken {
    /// Wrap a raw pointer to shared memory reserved/looked-up by the
    /// caller. The pointee must be at least 8-byte aligned and valid for
    /// the lifetime of this `IoToken`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `size_of::<u64>()` bytes of memory that is
    /// valid, properly aligned, and not concurrently accessed through any
    /// non-atomic path for as long as any `IoToken` wraps it.
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        IoToken {
            counter: ptr as *const AtomicU64,
        }
    }

    /// Atomically reserve `n` sequential token values, returning the first
    /// one. Uses sequentially-consistent ordering, matching `spec.md` §3:
    /// "a sequentially-consistent atomic fetch-add".
    pub fn next_token(&self, n: u64) -> u64 {
        // SAFETY: constructed only via `from_raw`, whose contract guarantees
        // the pointee is valid for atomic access.
        unsafe { (*self.counter).fetch_add(n, Ordering::SeqCst) }
    }
}
