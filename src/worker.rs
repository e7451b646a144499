//! The I/O worker: a single-qpair, single-threaded workload generator
//! (`spec.md` §4.4).
//!
//! The submission loop and the completion callback share state through a
//! pinned [`GlobalCtx`] and a fixed array of [`IoContext`]s, addressed by
//! raw pointer exactly as `spec.md` §9 "Callback trampoline" and "Cyclic
//! back-references" prescribe: no per-I/O heap allocation or boxed closure
//! sits on the completion hot path.

use crate::cmdlog::UserCallback;
use crate::error::Result;
use crate::nvme::{Controller, Namespace, QPair};
use crate::oracle::ChecksumOracle;
use crate::status::StatusTable;
use crate::token::IoToken;
use crate::transport::{self, RawCompletion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Ring depth used to bound `qdepth` (`spec.md` §4.4 step 1: `qdepth ≤
/// ring_depth/2`).
const RING_DEPTH: usize = crate::cmdlog::RING_DEPTH;

/// The 11-bit synthetic read-verification-failure status code
/// (`spec.md` §4.4 step 5).
const VERIFY_FAIL_STATUS: u16 = 0x0281;

/// Bucket count for `io_counter_per_latency`: microseconds 0..999999
/// (`spec.md` §3).
pub const LATENCY_BUCKETS: usize = 1_000_000;

/// `ioworker_run` success status code (`spec.md` §6).
pub const STATUS_SUCCESS: i32 = 0;
/// Transfer size exceeded the controller's maximum (`spec.md` §4.4 step 1).
pub const STATUS_INVALID_XFER: i32 = -2;
/// The watchdog fired before the run drained (`spec.md` §4.4, §5).
pub const STATUS_WATCHDOG: i32 = -3;
/// A submission call to the external driver failed mid-run.
pub const STATUS_SUBMISSION_FAILURE: i32 = -1;

/// Workload specification, caller-owned and read-only except for the two
/// sampling arrays `run` fills in place (`spec.md` §3). Serializable so it
/// can cross a process boundary between a primary and a secondary worker
/// process (`spec.md` §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoWorkerArgs {
    pub lba_start: u64,
    /// Block count per I/O.
    pub lba_size: u32,
    pub lba_align: u64,
    pub lba_random: bool,
    pub region_start: u64,
    pub region_end: u64,
    /// `[0, 100]`.
    pub read_percentage: u8,
    /// `0` means unbounded.
    pub io_count: u64,
    /// `0` means unbounded; clamped to 86400.
    pub seconds: u32,
    /// `0` means unthrottled.
    pub iops: u32,
    pub qdepth: u32,
    /// Slot index into the shared [`StatusTable`].
    pub wid: usize,
    /// Sized for one entry per second the run may last; `None` disables
    /// per-second sampling.
    #[serde(default)]
    pub io_counter_per_second: Option<Vec<u64>>,
    /// Sized [`LATENGY_BUCKETS`]; `None` disables latency histogram
    /// sampling.
    #[serde(default)]
    pub io_counter_per_latency: Option<Vec<u64>>,
}

/// Aggregated statistics returned by a completed (or aborted) run
/// (`spec.md` §3).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IoWorkerRets {
    pub io_count_read: u64,
    pub io_count_write: u64,
    pub latency_max_us: u32,
    pub mseconds: u64,
    /// First-observed NVMe status, packed `(SCT<<8)|SC`; `0` if none.
    pub error: u16,
}

/// The worker's state machine (`spec.md` §4.4 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Prefilling,
    Running,
    Draining,
    Done,
    Aborted,
}

/// A single preallocated, DMA-backed I/O slot. Stored in a boxed slice so
/// addresses are stable for the lifetime of a run: the completion
/// trampoline recovers a `*mut IoContext` directly from the transport's
/// opaque callback argument.
struct IoContext {
    buf: Vec<u8>,
    is_read: bool,
    sent_at: Instant,
    gctx: *mut GlobalCtx,
}

// SAFETY: every `IoContext` is only ever touched from the single thread
// driving `IoWorker::run`.
unsafe impl Send for IoContext {}

/// Mutable state shared by every in-flight I/O of one run, mirroring
/// `driver.c`'s `ioworker_global_ctx`. Lives on `run`'s stack and is never
/// moved once its address has been taken.
///
/// `ctrlr` erases the controller's transport lifetime to `'static`: the
/// borrow checker cannot express "valid for the body of `IoWorker::run`"
/// on a field reached only through raw pointers from a plain `fn`
/// trampoline, so the real bound (this struct never outlives `run`) is
/// upheld by construction instead.
struct GlobalCtx {
    ctrlr: *mut Controller<'static>,
    ns: *const Namespace,
    qpair: *const QPair,
    oracle: *const ChecksumOracle,
    token: *const IoToken,
    status: *const StatusTable,
    rng: *mut StdRng,
    wid: usize,
    read_percentage: u8,
    lba_random: bool,
    lba_align: u64,
    region_start: u64,
    region_end: u64,
    sequential_lba: u64,
    io_count_sent: u64,
    io_count_limit: u64,
    io_count_cplt: u64,
    flag_finish: bool,
    submission_error: Option<i32>,
    start: Instant,
    due_time: Instant,
    io_delay_time: Duration,
    io_due_time: Instant,
    time_next_sec: Instant,
    io_count_till_last_sec: u64,
    last_sec: usize,
    rets: IoWorkerRets,
    per_second: Option<Vec<u64>>,
    per_latency: Option<Vec<u64>>,
}

// SAFETY: single-threaded; every pointee outlives the run.
unsafe impl Send for GlobalCtx {}

fn align_down(n: u64, align: u64) -> u64 {
    if align == 0 {
        n
    } else {
        n - (n % align)
    }
}

fn align_up(n: u64, align: u64) -> u64 {
    if align == 0 || n % align == 0 {
        n
    } else {
        n + align - (n % align)
    }
}

/// A single-qpair, seeded workload generator. The seed is worker-private
/// (`spec.md` §9 "Random source"); it is not a shared thread-safe source.
pub struct IoWorker {
    rng: StdRng,
}

impl IoWorker {
    pub fn new(seed: u64) -> Self {
        IoWorker {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Run a workload to completion against `qpair`, per `spec.md` §4.4.
    /// Returns the aggregated statistics and the `ioworker_run` status
    /// code (`spec.md` §6: `{0, -2, -3, other negative}`).
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &mut self,
        ctrlr: &mut Controller<'_>,
        ns: &Namespace,
        qpair: &QPair,
        oracle: &ChecksumOracle,
        token: &IoToken,
        status: &StatusTable,
        args: &mut IoWorkerArgs,
    ) -> Result<(IoWorkerRets, i32)> {
        let mut state = WorkerState::Init;
        tracing::debug!(wid = args.wid, ?state, "ioworker starting");

        // Step 1: validate.
        let mut rets = IoWorkerRets::default();
        if args.read_percentage > 100
            || (args.io_count == 0 && args.seconds == 0)
            || args.seconds > 86400
            || args.lba_size == 0
            || args.region_start >= args.region_end
            || args.qdepth as usize > RING_DEPTH / 2
        {
            return Err(crate::error::HarnessError::InvalidArgument(
                "ioworker argument failed validation",
            ));
        }
        let requested_xfer = args.lba_size as usize * ns.block_size;
        let max_xfer = ctrlr.max_xfer_size();
        if requested_xfer > max_xfer {
            tracing::warn!(requested_xfer, max_xfer, "ioworker transfer size too large");
            rets.error = 0x0002;
            return Ok((rets, STATUS_INVALID_XFER));
        }

        // Step 2: normalize.
        let io_count_limit = if args.io_count == 0 {
            u64::MAX
        } else {
            args.io_count
        };
        let seconds = if args.seconds == 0 || args.seconds > 86400 {
            86400
        } else {
            args.seconds
        };
        args.region_end = args.region_end.min(ns.num_blocks);
        args.region_start = align_up(args.region_start, args.lba_align);
        let effective_region_end = align_down(
            args.region_end.saturating_sub(args.lba_size as u64).saturating_sub(1),
            args.lba_align,
        );
        if args.region_start > effective_region_end {
            return Err(crate::error::HarnessError::InvalidArgument(
                "lba_size leaves no room in the region",
            ));
        }
        if args.lba_start < args.region_start {
            args.lba_start = args.region_start;
        }
        let qdepth = (args.qdepth as u64).min(io_count_limit) as u32;

        // Step 3: timers.
        let start = Instant::now();
        let due_time = start + Duration::from_secs(seconds as u64);
        let io_delay_time = if args.iops == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(1_000_000 / args.iops as u64)
        };
        let io_due_time = start + io_delay_time;
        let time_next_sec = start + Duration::from_secs(1);

        // Step 4: per-I/O contexts.
        status.reset(args.wid);
        // SAFETY: `ctrlr` is erased to `'static` here; `gctx` (and every
        // `IoContext` pointing at it) is dropped before this function
        // returns, and nothing escapes it, so the real borrow never
        // outlives `ctrlr`.
        let erased_ctrlr = ctrlr as *mut Controller<'_> as *mut () as *mut Controller<'static>;
        let mut gctx = GlobalCtx {
            ctrlr: erased_ctrlr,
            ns: ns as *const Namespace,
            qpair: qpair as *const QPair,
            oracle: oracle as *const ChecksumOracle,
            token: token as *const IoToken,
            status: status as *const StatusTable,
            rng: &mut self.rng as *mut StdRng,
            wid: args.wid,
            read_percentage: args.read_percentage,
            lba_random: args.lba_random,
            lba_align: args.lba_align,
            region_start: args.region_start,
            region_end: effective_region_end,
            sequential_lba: args.lba_start,
            io_count_sent: 0,
            io_count_limit,
            io_count_cplt: 0,
            flag_finish: false,
            submission_error: None,
            start,
            due_time,
            io_delay_time,
            io_due_time,
            time_next_sec,
            io_count_till_last_sec: 0,
            last_sec: 0,
            rets,
            per_second: args.io_counter_per_second.take(),
            per_latency: args.io_counter_per_latency.take(),
        };
        let gctx_ptr: *mut GlobalCtx = &mut gctx;

        let buf_len = args.lba_size as usize * ns.block_size;
        let mut contexts: Box<[IoContext]> = (0..qdepth)
            .map(|_| IoContext {
                buf: vec![0u8; buf_len],
                is_read: false,
                sent_at: start,
                gctx: gctx_ptr,
            })
            .collect();

        state = WorkerState::Prefilling;
        tracing::debug!(wid = args.wid, ?state, "ioworker prefilling");
        for ctx in contexts.iter_mut() {
            // SAFETY: `gctx_ptr` is valid until this function returns;
            // `ctx` is addressable for the whole run (boxed slice, never
            // reallocated).
            unsafe { send_one(gctx_ptr, ctx as *mut IoContext) };
        }

        state = WorkerState::Running;
        tracing::debug!(wid = args.wid, ?state, "ioworker running");
        let watchdog_limit = Duration::from_secs(seconds as u64) + Duration::from_secs(10);
        let mut status_code = STATUS_SUCCESS;
        loop {
            if gctx.io_count_sent == gctx.io_count_cplt && gctx.flag_finish {
                break;
            }
            if start.elapsed() > watchdog_limit {
                state = WorkerState::Aborted;
                status_code = STATUS_WATCHDOG;
                tracing::warn!(wid = args.wid, "ioworker watchdog fired");
                break;
            }
            if gctx.flag_finish && state != WorkerState::Draining {
                state = WorkerState::Draining;
                tracing::debug!(wid = args.wid, ?state, "ioworker draining");
            }
            ctrlr.process_completions(Some(qpair), 0)?;
        }
        if state != WorkerState::Aborted {
            state = WorkerState::Done;
            tracing::debug!(wid = args.wid, ?state, "ioworker done");
        }
        if let Some(code) = gctx.submission_error {
            status_code = code;
        }

        gctx.rets.mseconds = start.elapsed().as_millis() as u64;
        args.io_counter_per_second = gctx.per_second.take();
        args.io_counter_per_latency = gctx.per_latency.take();
        Ok((gctx.rets, status_code))
    }
}

fn is_read_draw(rng: &mut StdRng, read_percentage: u8) -> bool {
    rng.gen_range(0..100) < read_percentage
}

fn next_lba(gctx: &mut GlobalCtx) -> u64 {
    let lba = if gctx.lba_random {
        if gctx.region_end <= gctx.region_start {
            gctx.region_start
        } else {
            // SAFETY: `rng` outlives the run.
            let rng = unsafe { &mut *gctx.rng };
            gctx.region_start + rng.gen_range(0..gctx.region_end - gctx.region_start)
        }
    } else {
        let next = gctx.sequential_lba + gctx.lba_align;
        let next = if next > gctx.region_end {
            gctx.region_start
        } else {
            next
        };
        gctx.sequential_lba = next;
        next
    };
    align_down(lba, gctx.lba_align)
}

fn send_one_is_finish(gctx: &GlobalCtx) -> bool {
    gctx.io_count_sent == gctx.io_count_limit || Instant::now() > gctx.due_time
}

/// Submit one I/O on `ctx`, choosing read/write mix and LBA, and record
/// it as sent (`spec.md` §4.4 "LBA selection", "Read/write decision").
///
/// # Safety
/// `gctx` and `ctx` must be valid for the duration of this call and
/// outlive any completion they may trigger.
unsafe fn send_one(gctx: *mut GlobalCtx, ctx: *mut IoContext) {
    let g = &mut *gctx;
    let c = &mut *ctx;

    let is_read = {
        let rng = &mut *g.rng;
        is_read_draw(rng, g.read_percentage)
    };
    let lba = next_lba(g);
    let lba_count = (c.buf.len() / (*g.ns).block_size) as u32;

    let ctrlr = &mut *g.ctrlr;
    let ns = &*g.ns;
    let qpair = &*g.qpair;
    let oracle = &*g.oracle;
    let token = &*g.token;

    let result = ctrlr.read_write(
        ns,
        qpair,
        oracle,
        token,
        is_read,
        &mut c.buf,
        lba,
        lba_count,
        0,
        Some(io_worker_trampoline as UserCallback),
        ctx as *mut (),
    );

    match result {
        Ok(()) => {
            c.is_read = is_read;
            c.sent_at = Instant::now();
            g.io_count_sent += 1;
            (*g.status).record_submit(g.wid);
        }
        Err(_) => {
            tracing::debug!("ioworker submission failed");
            g.flag_finish = true;
            g.submission_error = Some(STATUS_SUBMISSION_FAILURE);
        }
    }
}

fn io_worker_trampoline(arg: *mut (), cpl: &RawCompletion) {
    let ctx = arg as *mut IoContext;
    // SAFETY: `arg` is always the address of an `IoContext` held in the
    // run's `contexts` array, which outlives every I/O submitted against
    // it.
    unsafe { on_complete(ctx, cpl) };
}

/// The per-completion handler (`spec.md` §4.4 "Per-completion handler").
///
/// # Safety
/// `ctx` must point at a live `IoContext` whose `gctx` pointer is still
/// valid.
unsafe fn on_complete(ctx: *mut IoContext, cpl: &RawCompletion) {
    let c = &mut *ctx;
    let g = &mut *c.gctx;

    g.io_count_cplt += 1;
    (*g.status).record_complete(g.wid);

    let now = Instant::now();
    let latency = now.duration_since(c.sent_at);
    let latency_us = latency.as_micros().min(u32::MAX as u128) as u32;
    if latency_us > g.rets.latency_max_us {
        g.rets.latency_max_us = latency_us;
    }
    if c.is_read {
        g.rets.io_count_read += 1;
    } else {
        g.rets.io_count_write += 1;
    }

    if let Some(buckets) = g.per_latency.as_mut() {
        let idx = (latency_us as usize).min(LATENCY_BUCKETS - 1);
        buckets[idx] += 1;
    }

    if g.io_delay_time > Duration::ZERO {
        if g.io_due_time > now {
            std::thread::sleep(g.io_due_time - now);
        }
        g.io_due_time += g.io_delay_time;
    }

    if transport::is_error(cpl) {
        let code = transport::status_and_type(cpl);
        if code == VERIFY_FAIL_STATUS && g.read_percentage < 100 {
            tracing::debug!("suppressing verification-race status in mixed workload");
        } else {
            g.flag_finish = true;
            if g.rets.error == 0 {
                g.rets.error = code;
            }
        }
    }

    if let Some(per_second) = g.per_second.as_mut() {
        if now > g.time_next_sec {
            g.time_next_sec += Duration::from_secs(1);
            let current_total = g.rets.io_count_read + g.rets.io_count_write;
            if g.last_sec < per_second.len() {
                per_second[g.last_sec] = current_total - g.io_count_till_last_sec;
            }
            g.last_sec += 1;
            g.io_count_till_last_sec = current_total;
        }
    }

    if !g.flag_finish {
        g.flag_finish = send_one_is_finish(g);
    }
    if !g.flag_finish {
        send_one(c.gctx, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::Namespace;
    use crate::sim::{InMemoryShm, InMemoryTransport};
    use crate::transport::{IoQPairOpts, TransportAddress};

    // `InMemoryTransport::process_completions` completes everything
    // currently queued on the qpair, which is exactly what `IoWorker::run`
    // calls in its drain loop; no extra driving thread is needed; each
    // completion's callback submits at most one new I/O, queued for the
    // *next* `process_completions` call.

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    #[test]
    fn sequential_write_then_read_round_trips() {
        init_tracing();
        let transport = InMemoryTransport::new(1 << 20);
        let shm = InMemoryShm::default();
        let trid = TransportAddress::parse("host1");
        let mut ctrlr = Controller::attach(&transport, &trid).unwrap();
        let qpair = ctrlr.open_io_qpair(IoQPairOpts::for_depth(0, 8)).unwrap();
        let ns = Namespace::new(1024);
        let oracle = ChecksumOracle::attach(&shm, 1024, true).unwrap();
        let token_backing = std::sync::atomic::AtomicU64::new(0);
        let token = unsafe { IoToken::from_raw(&token_backing as *const _ as *mut u8) };
        let status = StatusTable::new();
        let mut worker = IoWorker::new(42);

        let mut write_args = IoWorkerArgs {
            lba_start: 0,
            lba_size: 1,
            lba_align: 1,
            lba_random: false,
            region_start: 0,
            region_end: 1024,
            read_percentage: 0,
            io_count: 1000,
            seconds: 0,
            iops: 0,
            qdepth: 8,
            wid: 0,
            io_counter_per_second: None,
            io_counter_per_latency: None,
        };

        let (write_rets, write_status) = worker
            .run(&mut ctrlr, &ns, &qpair, &oracle, &token, &status, &mut write_args)
            .unwrap();
        assert_eq!(write_status, STATUS_SUCCESS);
        assert_eq!(write_rets.io_count_write, 1000);
        assert_eq!(write_rets.io_count_read, 0);
        assert_eq!(write_rets.error, 0);

        let mut read_args = IoWorkerArgs {
            lba_start: 0,
            read_percentage: 100,
            io_count: 1000,
            ..write_args
        };
        let (read_rets, read_status) = worker
            .run(&mut ctrlr, &ns, &qpair, &oracle, &token, &status, &mut read_args)
            .unwrap();
        assert_eq!(read_status, STATUS_SUCCESS);
        assert_eq!(read_rets.io_count_read, 1000);
        assert_eq!(read_rets.error, 0);
    }

    #[test]
    fn region_wrap_sequential_follows_expected_lba_sequence() {
        init_tracing();
        let transport = InMemoryTransport::new(1 << 20);
        let shm = InMemoryShm::default();
        let trid = TransportAddress::parse("host1");
        let mut ctrlr = Controller::attach(&transport, &trid).unwrap();
        let qpair = ctrlr.open_io_qpair(IoQPairOpts::for_depth(0, 1)).unwrap();
        let ns = Namespace::new(8);
        let oracle = ChecksumOracle::attach(&shm, 8, true).unwrap();
        let token_backing = std::sync::atomic::AtomicU64::new(0);
        let token = unsafe { IoToken::from_raw(&token_backing as *const _ as *mut u8) };
        let status = StatusTable::new();
        let mut worker = IoWorker::new(7);

        let mut args = IoWorkerArgs {
            lba_start: 0,
            lba_size: 1,
            lba_align: 1,
            lba_random: false,
            region_start: 0,
            region_end: 8,
            read_percentage: 0,
            io_count: 20,
            seconds: 0,
            iops: 0,
            qdepth: 1,
            wid: 1,
            io_counter_per_second: None,
            io_counter_per_latency: None,
        };

        let (rets, status_code) = worker
            .run(&mut ctrlr, &ns, &qpair, &oracle, &token, &status, &mut args)
            .unwrap();
        assert_eq!(status_code, STATUS_SUCCESS);
        assert_eq!(rets.io_count_write, 20);

        // Recompute the wrap rule independently (same formula as `next_lba`,
        // applied to the normalized `effective_region_end`) and check the
        // emitted LBAs actually wrapped this way, rather than trusting a
        // count a bugged wrap could also produce.
        let lba_align = 1u64;
        let effective_region_end = align_down(8u64.saturating_sub(1).saturating_sub(1), lba_align);
        let mut sequential_lba = 0u64;
        let mut expected = Vec::with_capacity(20);
        for _ in 0..20 {
            let next = sequential_lba + lba_align;
            let next = if next > effective_region_end { 0 } else { next };
            sequential_lba = next;
            expected.push(align_down(next, lba_align));
        }

        let dumped = ctrlr.dump_log(qpair.qid(), 20);
        let actual: Vec<u64> = dumped.iter().map(|e| e.cdw10 as u64).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn read_uncorrectable_range_reports_synthetic_status() {
        init_tracing();
        let transport = InMemoryTransport::new(1 << 20);
        let shm = InMemoryShm::default();
        let trid = TransportAddress::parse("host1");
        let mut ctrlr = Controller::attach(&transport, &trid).unwrap();
        let qpair = ctrlr.open_io_qpair(IoQPairOpts::for_depth(0, 4)).unwrap();
        let ns = Namespace::new(1024);
        let oracle = ChecksumOracle::attach(&shm, 1024, true).unwrap();
        oracle.clear(100, 10, false, true);
        let token_backing = std::sync::atomic::AtomicU64::new(0);
        let token = unsafe { IoToken::from_raw(&token_backing as *const _ as *mut u8) };
        let status = StatusTable::new();
        let mut worker = IoWorker::new(3);

        let mut args = IoWorkerArgs {
            lba_start: 100,
            lba_size: 1,
            lba_align: 1,
            lba_random: false,
            region_start: 100,
            region_end: 110,
            read_percentage: 100,
            io_count: 0,
            seconds: 5,
            iops: 0,
            qdepth: 4,
            wid: 2,
            io_counter_per_second: None,
            io_counter_per_latency: None,
        };

        let (rets, status_code) = worker
            .run(&mut ctrlr, &ns, &qpair, &oracle, &token, &status, &mut args)
            .unwrap();
        assert_eq!(status_code, STATUS_SUCCESS);
        assert_eq!(rets.error, 0x0281);
    }
}
