//! The shared I/O worker live-status table (`spec.md` §3 "I/O worker live
//! status", §6 `ioworker_status`).

use std::sync::atomic::{AtomicU64, Ordering};

/// Number of worker slots in the shared status table (`spec.md` §3: "a
/// shared table (64 slots)").
pub const NUM_SLOTS: usize = 64;

/// One worker's live progress counters, as read by
/// [`StatusTable::read`]/[`ioworker_status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub io_count_sent: u64,
    pub io_count_cplt: u64,
}

#[repr(C)]
struct Slot {
    io_count_sent: AtomicU64,
    io_count_cplt: AtomicU64,
}

impl Slot {
    const fn zeroed() -> Self {
        Slot {
            io_count_sent: AtomicU64::new(0),
            io_count_cplt: AtomicU64::new(0),
        }
    }
}

/// A process-shared table of worker progress rows. Backed by a fixed-size
/// array rather than `Vec` so it can be placed directly in a shared-memory
/// zone by a caller that owns the allocation.
pub struct StatusTable {
    slots: [Slot; NUM_SLOTS],
}

// SAFETY: all access goes through atomic operations on the individual
// counters.
unsafe impl Send for StatusTable {}
unsafe impl Sync for StatusTable {}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTable {
    pub fn new() -> Self {
        StatusTable {
            slots: std::array::from_fn(|_| Slot::zeroed()),
        }
    }

    fn slot(&self, wid: usize) -> &Slot {
        assert!(wid < NUM_SLOTS, "worker id {wid} out of range ({NUM_SLOTS})");
        &self.slots[wid]
    }

    /// Record a new submission for worker `wid` (`spec.md` §4.4 step 1 of
    /// the primary loop: "updated after each submission").
    pub fn record_submit(&self, wid: usize) {
        self.slot(wid).io_count_sent.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a completion for worker `wid` (`spec.md` §4.4 per-completion
    /// handler step 1).
    pub fn record_complete(&self, wid: usize) {
        self.slot(wid).io_count_cplt.fetch_add(1, Ordering::SeqCst);
    }

    /// Reset a worker's row to zero, called at worker start.
    pub fn reset(&self, wid: usize) {
        let slot = self.slot(wid);
        slot.io_count_sent.store(0, Ordering::SeqCst);
        slot.io_count_cplt.store(0, Ordering::SeqCst);
    }

    /// Read a worker's current progress (`spec.md` §6 `ioworker_status`).
    pub fn read(&self, wid: usize) -> WorkerStatus {
        let slot = self.slot(wid);
        WorkerStatus {
            io_count_sent: slot.io_count_sent.load(Ordering::SeqCst),
            io_count_cplt: slot.io_count_cplt.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_slot_reads_as_zero() {
        let table = StatusTable::new();
        assert_eq!(table.read(3), WorkerStatus::default());
    }

    #[test]
    fn submit_and_complete_counters_are_independent() {
        let table = StatusTable::new();
        table.record_submit(1);
        table.record_submit(1);
        table.record_complete(1);
        let status = table.read(1);
        assert_eq!(status.io_count_sent, 2);
        assert_eq!(status.io_count_cplt, 1);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_slot_panics() {
        let table = StatusTable::new();
        table.record_submit(NUM_SLOTS);
    }
}
