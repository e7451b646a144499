//! In-memory test doubles for [`crate::transport`], used by this crate's
//! own unit and integration tests. Mirrors the `TestMem: MemoryBus` pattern
//! used to exercise queue/completion handling without real hardware.

use crate::error::{HarnessError, Result};
use crate::transport::{
    self, opcode, ControllerHandle, DmaAllocator, DmaBuffer, IoQPairOpts, NvmeTransport,
    QPairHandle, RawCommand, ShmFlags, SharedMemoryZone, TrampolineFn, TransportAddress,
    BLOCK_SIZE,
};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// A single queued-but-not-yet-completed command, captured so a test can
/// drive completion explicitly. `buf` is the raw address/length of the
/// caller's real buffer (not a copy) so that a completed Read can be played
/// back into the exact memory the caller will verify against.
pub struct PendingIo {
    pub cmd: RawCommand,
    pub buf: Option<(*mut u8, usize)>,
    pub trampoline: TrampolineFn,
    pub arg: *mut (),
}

// SAFETY: `arg` is always a stable pointer into a `CommandLog` ring, and
// `buf` always a pointer into a worker's per-context DMA buffer; both are
// kept alive by the test harness for as long as the simulated transport
// holds the pending command.
unsafe impl Send for PendingIo {}

/// A handful of zeroed blocks a test can hand back as the "device's"
/// response to a read, keyed by queue id.
#[derive(Default)]
struct QueueState {
    pending: Vec<PendingIo>,
}

/// An in-memory stand-in for a real NVMe transport. Submissions are queued;
/// a test calls [`InMemoryTransport::complete_next`] or
/// [`InMemoryTransport::complete_all`] to run trampolines, synthesizing a
/// successful completion (all-zero status) unless told otherwise.
///
/// Write and Read commands carry real data: `storage` holds the last
/// written block for every LBA, keyed by block, so a Read's buffer is
/// actually filled with whatever a prior Write last stored there (or left
/// zeroed if the LBA was never written) before its trampoline runs. Without
/// this, the checksum oracle would see stale/zeroed data on every read and
/// report spurious verification failures.
#[derive(Default)]
pub struct InMemoryTransport {
    queues: Mutex<HashMap<Option<u16>, QueueState>>,
    storage: Mutex<HashMap<u64, [u8; BLOCK_SIZE]>>,
    max_xfer: usize,
}

impl InMemoryTransport {
    pub fn new(max_xfer: usize) -> Self {
        InMemoryTransport {
            queues: Mutex::new(HashMap::new()),
            storage: Mutex::new(HashMap::new()),
            max_xfer,
        }
    }

    fn push(&self, qid: Option<u16>, io: PendingIo) {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(qid).or_default().pending.push(io);
    }

    /// Decode the LBA and block count a Write/Read command addresses, per
    /// the `spec.md` §6 encoding: CDW10/11 = low/high 32 bits of the LBA,
    /// CDW12 = `(count - 1) | (flags << 16)`.
    fn decode_lba_range(cmd: &RawCommand) -> (u64, u32) {
        let lba = u32::from_le_bytes(cmd[40..44].try_into().unwrap()) as u64
            | (u32::from_le_bytes(cmd[44..48].try_into().unwrap()) as u64) << 32;
        let cdw12 = u32::from_le_bytes(cmd[48..52].try_into().unwrap());
        let count = (cdw12 & 0xFFFF) + 1;
        (lba, count)
    }

    /// For a Write, copy each submitted block into `storage`; for a Read,
    /// copy any previously stored blocks back into the caller's buffer.
    /// Runs before the command's trampoline so verification sees real data.
    fn play_back(&self, io: &PendingIo) {
        let op = io.cmd[0];
        if op != opcode::WRITE && op != opcode::READ {
            return;
        }
        let Some((ptr, len)) = io.buf else { return };
        let (lba, count) = Self::decode_lba_range(&io.cmd);
        // SAFETY: `ptr`/`len` describe the caller's live buffer for this
        // command, kept alive until this trampoline runs (see `PendingIo`).
        let buf = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
        let mut storage = self.storage.lock().unwrap();
        for i in 0..count as usize {
            let range = i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE;
            if range.end > buf.len() {
                break;
            }
            let block_lba = lba + i as u64;
            if op == opcode::WRITE {
                let mut stored = [0u8; BLOCK_SIZE];
                stored.copy_from_slice(&buf[range]);
                storage.insert(block_lba, stored);
            } else if let Some(stored) = storage.get(&block_lba) {
                buf[range].copy_from_slice(stored);
            }
        }
    }

    /// Complete every pending command on `qid` with an all-zero ("success")
    /// completion, in submission order.
    pub fn complete_all(&self, qid: Option<u16>) -> usize {
        self.complete_all_with(qid, [0u8; 16])
    }

    /// Like [`InMemoryTransport::complete_all`] but with a caller-supplied
    /// completion image (e.g. to simulate a device-reported error).
    pub fn complete_all_with(&self, qid: Option<u16>, cpl: crate::transport::RawCompletion) -> usize {
        let pending = {
            let mut queues = self.queues.lock().unwrap();
            queues
                .get_mut(&qid)
                .map(|q| std::mem::take(&mut q.pending))
                .unwrap_or_default()
        };
        let count = pending.len();
        for io in pending {
            self.play_back(&io);
            (io.trampoline)(io.arg, cpl);
        }
        count
    }
}

impl NvmeTransport for InMemoryTransport {
    fn probe(&self, _trid: &TransportAddress) -> Result<ControllerHandle> {
        Ok(ControllerHandle(1))
    }

    fn alloc_io_qpair(&self, _ctrlr: ControllerHandle, _opts: IoQPairOpts) -> Result<QPairHandle> {
        static NEXT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(1);
        let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(QPairHandle { id })
    }

    fn free_io_qpair(&self, _ctrlr: ControllerHandle, qpair: QPairHandle) {
        self.queues.lock().unwrap().remove(&Some(qpair.id));
    }

    fn submit_admin_raw(
        &self,
        _ctrlr: ControllerHandle,
        cmd: &RawCommand,
        buf: Option<&mut [u8]>,
        trampoline: TrampolineFn,
        arg: *mut (),
    ) -> Result<()> {
        self.push(
            None,
            PendingIo {
                cmd: *cmd,
                buf: buf.map(|b| (b.as_mut_ptr(), b.len())),
                trampoline,
                arg,
            },
        );
        Ok(())
    }

    fn submit_io_raw(
        &self,
        _ctrlr: ControllerHandle,
        qpair: QPairHandle,
        cmd: &RawCommand,
        buf: Option<&mut [u8]>,
        trampoline: TrampolineFn,
        arg: *mut (),
    ) -> Result<()> {
        self.push(
            Some(qpair.id),
            PendingIo {
                cmd: *cmd,
                buf: buf.map(|b| (b.as_mut_ptr(), b.len())),
                trampoline,
                arg,
            },
        );
        Ok(())
    }

    fn process_completions(
        &self,
        _ctrlr: ControllerHandle,
        qpair: Option<QPairHandle>,
        max: u32,
    ) -> Result<u32> {
        let qid = qpair.map(|q| q.id);
        let n = self.complete_all(qid);
        let n = if max == 0 { n } else { n.min(max as usize) };
        Ok(n as u32)
    }

    fn max_xfer_size(&self, _ctrlr: ControllerHandle) -> usize {
        self.max_xfer
    }
}

/// A bump-allocating in-memory [`DmaAllocator`]: every buffer is a regular
/// heap allocation with a fabricated, strictly-increasing "physical
/// address".
#[derive(Default)]
pub struct InMemoryDmaAllocator {
    next_paddr: Mutex<u64>,
}

impl DmaAllocator for InMemoryDmaAllocator {
    fn alloc(&self, size: usize, align: usize) -> Result<DmaBuffer> {
        if size == 0 {
            return Err(HarnessError::InvalidArgument("dma alloc size must be > 0"));
        }
        let mut next = self.next_paddr.lock().unwrap();
        let paddr = *next;
        *next += (size as u64).div_ceil(align as u64) * align as u64;
        let data = vec![0u8; size].into_boxed_slice();
        Ok(DmaBuffer::new(data, paddr))
    }
}

/// An in-memory [`SharedMemoryZone`]: zones are plain heap allocations kept
/// alive in a process-wide map, simulating the single-process case where
/// "shared" memory is just memory every worker thread can see.
#[derive(Default)]
pub struct InMemoryShm {
    zones: RwLock<HashMap<String, Box<[u8]>>>,
}

impl SharedMemoryZone for InMemoryShm {
    fn reserve(&self, name: &str, size: usize, _flags: ShmFlags) -> Result<*mut u8> {
        let mut zones = self.zones.write().unwrap();
        let zone = zones
            .entry(name.to_string())
            .or_insert_with(|| vec![0u8; size].into_boxed_slice());
        Ok(zone.as_mut_ptr())
    }

    fn lookup(&self, name: &str) -> Option<*mut u8> {
        let mut zones = self.zones.write().unwrap();
        zones.get_mut(name).map(|z| z.as_mut_ptr())
    }

    fn free(&self, name: &str) {
        self.zones.write().unwrap().remove(name);
    }
}
