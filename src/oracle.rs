//! The checksum oracle: a process-shared, LBA-indexed table of per-block
//! CRC32C values (`spec.md` §4.1).

use crate::buffer::block_crc32c;
use crate::error::{HarnessError, Result};
use crate::transport::{ShmFlags, SharedMemoryZone};
use std::sync::atomic::{AtomicU32, Ordering};

/// Well-known shared-memory zone name for the checksum table.
pub const TABLE_NAME: &str = "driver_crc32_table";

/// Sentinel meaning "unmapped" — the block has never been written (or was
/// trimmed); reads of it skip verification.
pub const UNMAPPED: u32 = 0;

/// Sentinel meaning "uncorrectable" — any read of the block must fail
/// verification.
pub const UNCORRECTABLE: u32 = 0xFFFF_FFFF;

/// A verification failure produced by [`ChecksumOracle::verify_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    /// The oracle slot was the uncorrectable sentinel.
    Uncorrectable,
    /// The LBA stamped in the block didn't match the LBA being read.
    LbaMismatch { expected: u64, found: u64 },
    /// The recomputed CRC32C didn't match the table's recorded value.
    CrcMismatch { expected: u32, found: u32 },
}

/// Process-shared LBA → CRC32C table.
///
/// Created by the primary process when the namespace is attached (sized
/// `4 bytes * num_logical_blocks`); attached by secondary processes by
/// looking the same zone up. Only the primary tears it down.
pub struct ChecksumOracle {
    table: *const AtomicU32,
    len: u64,
    primary: bool,
}

// SAFETY: the table is shared memory by construction; all accesses go
// through `AtomicU32` operations.
unsafe impl Send for ChecksumOracle {}
unsafe impl Sync for ChecksumOracle {}

impl ChecksumOracle {
    /// Attach to the checksum table for a namespace of `num_blocks` logical
    /// blocks. The primary process reserves the zone; secondary processes
    /// look it up. Fails if reservation/lookup returns nothing
    /// (`spec.md` §4.1 `attach`).
    pub fn attach(shm: &dyn SharedMemoryZone, num_blocks: u64, primary: bool) -> Result<Self> {
        let size = num_blocks as usize * std::mem::size_of::<u32>();
        let ptr = if primary {
            shm.reserve(
                TABLE_NAME,
                size,
                ShmFlags {
                    no_iova_contig: true,
                },
            )?
        } else {
            shm.lookup(TABLE_NAME)
                .ok_or_else(|| HarnessError::SharedMemoryUnavailable(TABLE_NAME.to_string()))?
        };

        tracing::debug!(num_blocks, primary, "checksum oracle attached");
        Ok(ChecksumOracle {
            table: ptr as *const AtomicU32,
            len: num_blocks,
            primary,
        })
    }

    /// Whether this handle was created by the primary process (and is
    /// therefore responsible for tearing the zone down).
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    fn slot(&self, lba: u64) -> &AtomicU32 {
        assert!(lba < self.len, "lba {lba} out of range ({})", self.len);
        // SAFETY: bounds-checked above; `table` is valid for `len` elements
        // for the lifetime of this oracle.
        unsafe { &*self.table.add(lba as usize) }
    }

    /// Store a clamped CRC32C for a single block (`spec.md` §4.1 `update`).
    /// `crc` is expected to already be normalized (see
    /// [`crate::buffer::normalize_crc`]); it is clamped again defensively.
    pub fn update(&self, lba: u64, crc: u32) {
        let clamped = crate::buffer::normalize_crc(crc);
        self.slot(lba).store(clamped, Ordering::SeqCst);
    }

    /// Fetch the raw slot value for an LBA (`spec.md` §4.1 `lookup`).
    pub fn lookup(&self, lba: u64) -> u32 {
        self.slot(lba).load(Ordering::SeqCst)
    }

    /// Clear `count` slots starting at `lba` to unmapped (`sanitize`/
    /// `uncorrectable` false) or the uncorrectable sentinel
    /// (`uncorrectable` true). When `sanitize` is set, `lba` must be 0 and
    /// the whole table is cleared (`spec.md` §4.1 `clear`).
    pub fn clear(&self, lba: u64, count: u64, sanitize: bool, uncorrectable: bool) {
        let value = if uncorrectable { UNCORRECTABLE } else { UNMAPPED };
        if sanitize {
            assert_eq!(lba, 0, "sanitize clear must start at lba 0");
            tracing::debug!("clearing the whole checksum table");
            for i in 0..self.len {
                self.slot(i).store(value, Ordering::SeqCst);
            }
            return;
        }
        for i in lba..lba + count {
            self.slot(i).store(value, Ordering::SeqCst);
        }
    }

    /// Verify every block of a read, in LBA order, per the protocol in
    /// `spec.md` §4.1: unmapped blocks are skipped, uncorrectable blocks
    /// fail immediately, then the stamped LBA and recomputed CRC32C are
    /// checked. Returns the first failure encountered, if any.
    pub fn verify_read(&self, buf: &[u8], lba_start: u64, lba_count: u32, block_size: usize) -> std::result::Result<(), VerifyFailure> {
        for i in 0..lba_count as usize {
            let lba = lba_start + i as u64;
            let expected = self.lookup(lba);
            if expected == UNMAPPED {
                continue;
            }
            if expected == UNCORRECTABLE {
                tracing::warn!(lba, "lba uncorrectable");
                return Err(VerifyFailure::Uncorrectable);
            }

            let block = &buf[i * block_size..(i + 1) * block_size];
            let found_lba = crate::buffer::stamped_lba(block);
            if found_lba != lba {
                tracing::warn!(lba, found_lba, "lba mismatch");
                return Err(VerifyFailure::LbaMismatch {
                    expected: lba,
                    found: found_lba,
                });
            }

            let found_crc = block_crc32c(block);
            if found_crc != expected {
                tracing::warn!(lba, expected, found_crc, "crc mismatch");
                return Err(VerifyFailure::CrcMismatch {
                    expected,
                    found: found_crc,
                });
            }
        }
        Ok(())
    }
}

impl Drop for ChecksumOracle {
    fn drop(&mut self) {
        if self.primary {
            tracing::debug!("checksum oracle torn down by primary");
        }
    }
}
