//! Process lifecycle: environment init/teardown and the primary/secondary
//! role split (`spec.md` §4.5).

use crate::cmdlog::CommandLog;
use crate::error::Result;
use crate::transport::ADMIN_QUEUE;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Shared-memory group id used so every process attaching to the same run
/// sees the same oracle table, token, and status table.
pub const SHM_GROUP_ID_DEFAULT: i32 = 0;

/// Whether this process created the shared state (and is responsible for
/// tearing it down) or merely attached to state a primary already created
/// (`spec.md` §4.5 "Primary vs secondary").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// Process-wide setup/teardown, mirroring `driver.c`'s `driver_init`/
/// `driver_fini`. Owns the admin-queue command log and the process's
/// deterministic PRNG seed; the external driver environment itself (DMA
/// pool, PCIe/TCP transport, shared-memory subsystem) is the caller's
/// responsibility to bring up before calling [`Lifecycle::init`] — this
/// crate only consumes it (`spec.md` §1 Non-goals).
pub struct Lifecycle {
    role: Role,
    core_mask: u64,
    shm_group_id: i32,
    admin_log: CommandLog,
    rng: StdRng,
}

impl Lifecycle {
    /// Bring up process-wide state: seed the deterministic PRNG from an
    /// explicit seed (rather than system time, so call sites control
    /// reproducibility directly — `spec.md` §9 "Random source"), open the
    /// admin queue's command log, and compute the core mask the external
    /// environment should pin this process to.
    ///
    /// `core_mask = 1 << (pid mod cpu_count)`, spreading concurrently
    /// running processes across cores (`spec.md` §4.5 `init`).
    pub fn init(role: Role, seed: u64, pid: u32, cpu_count: u32, shm_group_id: i32) -> Result<Self> {
        let core_mask = if cpu_count == 0 {
            1
        } else {
            1u64 << (pid % cpu_count) as u64
        };

        let mut admin_log = CommandLog::new();
        admin_log.open(ADMIN_QUEUE)?;

        tracing::info!(?role, core_mask, shm_group_id, "harness process initialized");
        Ok(Lifecycle {
            role,
            core_mask,
            shm_group_id,
            admin_log,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    pub fn core_mask(&self) -> u64 {
        self.core_mask
    }

    pub fn shm_group_id(&self) -> i32 {
        self.shm_group_id
    }

    /// Derive a fresh per-worker seed from this process's PRNG stream, so
    /// each `IoWorker` gets a distinct but reproducible seed without
    /// sharing one thread-unsafe generator across workers.
    pub fn next_worker_seed(&mut self) -> u64 {
        rand::RngCore::next_u64(&mut self.rng)
    }

    pub fn admin_log(&self) -> &CommandLog {
        &self.admin_log
    }

    pub fn admin_log_mut(&mut self) -> &mut CommandLog {
        &mut self.admin_log
    }

    /// Tear down process-wide state owned by this crate: close the
    /// admin-queue command log. The external environment's own teardown
    /// (transport disconnect, DMA pool release, shared-memory unmap) is
    /// the driver's responsibility (`spec.md` §4.5 `fini`); only the
    /// primary frees shared-memory zones it created — that happens in
    /// `ChecksumOracle::drop`, not here.
    pub fn fini(mut self) {
        tracing::info!(?self.role, "harness process shutting down");
        self.admin_log.close(ADMIN_QUEUE);
    }
}
