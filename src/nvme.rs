//! The NVMe façade (`spec.md` §4.3): a thin, opaque wrapper over
//! [`crate::transport::NvmeTransport`] that wires command construction,
//! the command log, and checksum-oracle bookkeeping together.

use crate::buffer::fill_write_payload;
use crate::cmdlog::{CommandLog, LogEntry, UserCallback, VerifyCtx};
use crate::error::{HarnessError, Result};
use crate::oracle::ChecksumOracle;
use crate::token::IoToken;
use crate::transport::{
    self, opcode, ControllerHandle, IoQPairOpts, NvmeTransport, QPairHandle, RawCommand,
    TransportAddress, BLOCK_SIZE,
};

/// A namespace handle. The core supports exactly one namespace, id 1
/// (`spec.md` §1 Non-goals, §4.3 constraints).
#[derive(Debug, Clone, Copy)]
pub struct Namespace {
    pub nsid: u32,
    pub num_blocks: u64,
    pub block_size: usize,
}

impl Namespace {
    pub const NSID: u32 = 1;

    pub fn new(num_blocks: u64) -> Self {
        Namespace {
            nsid: Self::NSID,
            num_blocks,
            block_size: BLOCK_SIZE,
        }
    }
}

/// An open I/O queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QPair {
    handle: QPairHandle,
    qid: u16,
}

impl QPair {
    pub fn qid(&self) -> u16 {
        self.qid
    }
}

/// A decoded deallocate (Dataset Management) range, as laid out in the
/// 16-byte `spdk_nvme_dsm_range` struct the original driver consumes:
/// context attributes (4 bytes, ignored here), length in blocks (4 bytes),
/// starting LBA (8 bytes).
fn decode_dsm_ranges(buf: &[u8], count: u32) -> Vec<(u64, u32)> {
    let count = (count as usize).min(buf.len() / 16);
    let mut ranges = Vec::with_capacity(count);
    for i in 0..count {
        let range = &buf[i * 16..(i + 1) * 16];
        let length = u32::from_le_bytes(range[4..8].try_into().unwrap());
        let starting_lba = u64::from_le_bytes(range[8..16].try_into().unwrap());
        ranges.push((starting_lba, length));
    }
    ranges
}

fn log_entry_trampoline(arg: *mut (), cpl: transport::RawCompletion) {
    let entry = arg as *mut LogEntry;
    // SAFETY: `arg` is always the address of a `LogEntry` owned by this
    // controller's `CommandLog`, which outlives every command submitted
    // through it (entries are never freed individually, per `spec.md` §3).
    unsafe { (*entry).complete(cpl) };
}

/// Controller handle plus the command log covering every queue opened
/// against it.
pub struct Controller<'a> {
    transport: &'a dyn NvmeTransport,
    handle: ControllerHandle,
    log: CommandLog,
}

impl<'a> Controller<'a> {
    /// Probe and attach to a controller, opening the admin queue's command
    /// log (`spec.md` §4.5 `init`).
    pub fn attach(transport: &'a dyn NvmeTransport, trid: &TransportAddress) -> Result<Self> {
        let handle = transport.probe(trid)?;
        let mut log = CommandLog::new();
        log.open(transport::ADMIN_QUEUE)?;
        Ok(Controller {
            transport,
            handle,
            log,
        })
    }

    pub fn max_xfer_size(&self) -> usize {
        self.transport.max_xfer_size(self.handle)
    }

    pub fn register_timeout_cb(&self, timeout_secs: u32) {
        self.transport.register_timeout_cb(self.handle, timeout_secs);
    }

    /// Open an I/O queue pair and its command log ring (`spec.md` §4.3).
    pub fn open_io_qpair(&mut self, opts: IoQPairOpts) -> Result<QPair> {
        let handle = self.transport.alloc_io_qpair(self.handle, opts)?;
        self.log.open(handle.id)?;
        Ok(QPair {
            handle,
            qid: handle.id,
        })
    }

    /// Close an I/O queue pair and its command log ring.
    pub fn close_io_qpair(&mut self, qpair: QPair) {
        self.transport.free_io_qpair(self.handle, qpair.handle);
        self.log.close(qpair.qid);
    }

    /// Poll for completions on `qpair` (admin queue if `None`), running
    /// trampolines inline (`spec.md` §4.3, §6).
    pub fn process_completions(&self, qpair: Option<&QPair>, max: u32) -> Result<u32> {
        self.transport
            .process_completions(self.handle, qpair.map(|q| q.handle), max)
    }

    /// A debug dump of one queue's command log ring (`spec.md` §4.2).
    pub fn dump_log(&self, qid: u16, dump_count: usize) -> Vec<crate::cmdlog::DumpedEntry> {
        self.log.dump(qid, dump_count)
    }

    fn build_cmd(opcode: u8, nsid: u32, cdw10: u32, cdw11: u32, cdw12: u32) -> RawCommand {
        let mut cmd = [0u8; 64];
        cmd[0] = opcode;
        cmd[4..8].copy_from_slice(&nsid.to_le_bytes());
        cmd[40..44].copy_from_slice(&cdw10.to_le_bytes());
        cmd[44..48].copy_from_slice(&cdw11.to_le_bytes());
        cmd[48..52].copy_from_slice(&cdw12.to_le_bytes());
        cmd
    }

    /// Submit a raw admin or I/O command, recording it in the log first
    /// (`spec.md` §4.3 `submit_raw`). Admin submissions pass `qpair = None`
    /// (qid 0). Dataset Management (opcode 0x09) with a deallocate buffer
    /// pre-clears the corresponding oracle ranges before submission.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_raw(
        &mut self,
        qpair: Option<&QPair>,
        opcode: u8,
        nsid: u32,
        oracle: Option<&ChecksumOracle>,
        mut buf: Option<&mut [u8]>,
        cdw10: u32,
        cdw11: u32,
        cdw12: u32,
        user_cb: Option<UserCallback>,
        user_arg: *mut (),
    ) -> Result<()> {
        let cmd = Self::build_cmd(opcode, nsid, cdw10, cdw11, cdw12);
        let qid = qpair.map(|q| q.qid).unwrap_or(transport::ADMIN_QUEUE);

        if qpair.is_some() && opcode == transport::opcode::DATASET_MANAGEMENT {
            if let (Some(buf), Some(oracle)) = (buf.as_deref(), oracle) {
                for (starting_lba, length) in decode_dsm_ranges(buf, cdw10 + 1) {
                    tracing::debug!(lba = starting_lba, length, "deallocate");
                    oracle.clear(starting_lba, length as u64, false, false);
                }
            }
        }

        let entry_ptr = self
            .log
            .record_submit(qid, cmd, None, user_cb, user_arg)?;
        let buf_ref = buf.as_deref_mut();

        let result = if let Some(qpair) = qpair {
            self.transport.submit_io_raw(
                self.handle,
                qpair.handle,
                &cmd,
                buf_ref,
                log_entry_trampoline,
                entry_ptr as *mut (),
            )
        } else {
            self.transport.submit_admin_raw(
                self.handle,
                &cmd,
                buf_ref,
                log_entry_trampoline,
                entry_ptr as *mut (),
            )
        };
        result.map_err(|_| HarnessError::Submission(0))
    }

    /// Construct and submit a Read (opcode 0x02) or Write (opcode 0x01)
    /// command (`spec.md` §4.3 `read_write`). For writes, fills the buffer
    /// with LBA/token stamps and updates the oracle *before* submission
    /// (`spec.md` §3 invariant 1).
    #[allow(clippy::too_many_arguments)]
    pub fn read_write(
        &mut self,
        ns: &Namespace,
        qpair: &QPair,
        oracle: &ChecksumOracle,
        token: &IoToken,
        is_read: bool,
        buf: &mut [u8],
        lba: u64,
        lba_count: u32,
        io_flags: u16,
        user_cb: Option<UserCallback>,
        user_arg: *mut (),
    ) -> Result<()> {
        assert_eq!(ns.nsid, Namespace::NSID, "only namespace 1 is supported");
        assert_eq!(ns.block_size, BLOCK_SIZE);
        let required = lba_count as usize * ns.block_size;
        if buf.len() < required {
            return Err(HarnessError::InvalidArgument(
                "buffer too small for lba_count * block_size",
            ));
        }

        let op = if is_read { opcode::READ } else { opcode::WRITE };
        let cdw10 = lba as u32;
        let cdw11 = (lba >> 32) as u32;
        let cdw12 = (lba_count - 1) | (u32::from(io_flags) << 16);
        let cmd = Self::build_cmd(op, ns.nsid, cdw10, cdw11, cdw12);

        let verify = if is_read {
            Some(VerifyCtx {
                oracle: oracle as *const ChecksumOracle,
                buf: buf.as_ptr(),
                lba,
                lba_count,
                block_size: ns.block_size,
            })
        } else {
            let token_base = token.next_token(lba_count as u64);
            let crcs = fill_write_payload(buf, lba, lba_count, ns.block_size, token_base);
            for (i, crc) in crcs.into_iter().enumerate() {
                oracle.update(lba + i as u64, crc);
            }
            None
        };

        let entry_ptr = self
            .log
            .record_submit(qpair.qid, cmd, verify, user_cb, user_arg)?;

        self.transport
            .submit_io_raw(
                self.handle,
                qpair.handle,
                &cmd,
                Some(buf),
                log_entry_trampoline,
                entry_ptr as *mut (),
            )
            .map_err(|_| HarnessError::Submission(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::InMemoryTransport;

    #[test]
    fn read_write_encodes_cdw10_11_12() {
        let transport = InMemoryTransport::new(1 << 20);
        let trid = TransportAddress::parse("host1");
        let mut ctrlr = Controller::attach(&transport, &trid).unwrap();
        let qpair = ctrlr.open_io_qpair(IoQPairOpts::for_depth(0, 8)).unwrap();

        let shm = crate::sim::InMemoryShm::default();
        let oracle = ChecksumOracle::attach(&shm, 1024, true).unwrap();
        let token_backing = std::sync::atomic::AtomicU64::new(0);
        let token = unsafe { IoToken::from_raw(&token_backing as *const _ as *mut u8) };

        let ns = Namespace::new(1024);
        let mut buf = vec![0u8; 512 * 3];
        ctrlr
            .read_write(
                &ns,
                &qpair,
                &oracle,
                &token,
                false,
                &mut buf,
                7,
                3,
                0,
                None,
                std::ptr::null_mut(),
            )
            .unwrap();

        let dumped = ctrlr.dump_log(qpair.qid(), 1);
        assert_eq!(dumped[0].opcode, opcode::WRITE);
        assert_eq!(dumped[0].cdw10, 7, "cdw10 holds the low 32 bits of the lba");
    }

    #[test]
    fn dsm_deallocate_clears_oracle_before_submission() {
        let transport = InMemoryTransport::new(1 << 20);
        let trid = TransportAddress::parse("host1");
        let mut ctrlr = Controller::attach(&transport, &trid).unwrap();
        let qpair = ctrlr.open_io_qpair(IoQPairOpts::for_depth(0, 8)).unwrap();

        let shm = crate::sim::InMemoryShm::default();
        let oracle = ChecksumOracle::attach(&shm, 1024, true).unwrap();
        oracle.update(5, 123);

        let mut range = [0u8; 16];
        range[4..8].copy_from_slice(&2u32.to_le_bytes());
        range[8..16].copy_from_slice(&5u64.to_le_bytes());

        ctrlr
            .submit_raw(
                Some(&qpair),
                transport::opcode::DATASET_MANAGEMENT,
                Namespace::NSID,
                Some(&oracle),
                Some(&mut range),
                0, // cdw10 = count - 1 = 0 => one range
                0,
                0,
                None,
                std::ptr::null_mut(),
            )
            .unwrap();

        assert_eq!(oracle.lookup(5), crate::oracle::UNMAPPED);
    }
}
