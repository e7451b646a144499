//! Checksum-verifying NVMe block-device test harness.
//!
//! This crate implements the core of an NVMe test-harness driver: a
//! process-shared checksum oracle, a per-queue command log with a
//! completion trampoline, and an asynchronous single-qpair I/O worker. It
//! does not implement an NVMe driver itself — [`transport`] defines the
//! contract an external user-space driver (PCIe or TCP) must satisfy;
//! [`sim`] provides an in-memory double used by this crate's own tests.

pub mod buffer;
pub mod cmdlog;
pub mod error;
pub mod nvme;
pub mod oracle;
pub mod process;
pub mod sim;
pub mod status;
pub mod token;
pub mod transport;
pub mod worker;

pub use error::{HarnessError, Result};
pub use nvme::{Controller, Namespace, QPair};
pub use oracle::ChecksumOracle;
pub use process::{Lifecycle, Role};
pub use status::StatusTable;
pub use token::IoToken;
pub use worker::{IoWorker, IoWorkerArgs, IoWorkerRets};

/// `ioworker_run(ns, qpair, args) -> (rets, status_code)` (`spec.md` §6
/// "Worker API surface"), as a free function over a freshly seeded
/// [`IoWorker`] for callers that don't need to reuse a worker across runs.
#[allow(clippy::too_many_arguments)]
pub fn ioworker_run(
    seed: u64,
    ctrlr: &mut Controller<'_>,
    ns: &Namespace,
    qpair: &QPair,
    oracle: &ChecksumOracle,
    token: &IoToken,
    status: &StatusTable,
    args: &mut IoWorkerArgs,
) -> Result<(IoWorkerRets, i32)> {
    IoWorker::new(seed).run(ctrlr, ns, qpair, oracle, token, status, args)
}

/// `ioworker_status(wid) -> {io_count_sent, io_count_cplt}` (`spec.md` §6).
pub fn ioworker_status(status: &StatusTable, wid: usize) -> status::WorkerStatus {
    status.read(wid)
}
