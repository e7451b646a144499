//! Crate-wide error type.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors surfaced by setup, submission, and the I/O worker.
///
/// Individual NVMe command failures observed during a run are *not*
/// represented here: those are packed `(SCT<<8)|SC` status codes carried in
/// [`crate::worker::IoWorkerRets::error`], per the NVMe completion contract
/// downstream tooling expects. This type is for the Rust-level `Result`
/// plumbing around setup and submission.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A workload argument failed validation before any I/O was issued.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The worker's per-I/O transfer size exceeds the controller's
    /// advertised maximum transfer size.
    #[error("transfer size {requested} bytes exceeds controller max {max} bytes")]
    TransferSizeExceeded { requested: usize, max: usize },

    /// A named shared-memory zone could not be reserved or looked up.
    #[error("shared memory zone `{0}` unavailable")]
    SharedMemoryUnavailable(String),

    /// The command log ring for a queue could not be allocated.
    #[error("failed to allocate command log table for queue {0}")]
    LogTableAllocation(u16),

    /// `qid` is not less than [`crate::cmdlog::MAX_QUEUES`].
    #[error("queue id {0} exceeds the maximum of {1} queues")]
    TooManyQueues(u16, u16),

    /// The queue id has no open command log (never opened, or already closed).
    #[error("queue {0} has no open command log")]
    QueueNotOpen(u16),

    /// The external driver rejected a submission.
    #[error("submission failed with nvme status {0:#06x}")]
    Submission(u16),

    /// The I/O worker's watchdog fired before the run drained.
    #[error("ioworker watchdog expired after {0} ms")]
    Watchdog(u64),
}
