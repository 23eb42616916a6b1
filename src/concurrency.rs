//! Process-wide gates bounding concurrent file reads and concurrent line
//! processing, mirroring `readConcurrencyCh`/`processConcurrencyCh` in the
//! Go original: two global semaphores, sized once at startup, shared by
//! every reader for the lifetime of the process.

use std::sync::OnceLock;

use tokio::sync::{Semaphore, SemaphorePermit};

static READ_GATE: OnceLock<Semaphore> = OnceLock::new();
static PROCESS_GATE: OnceLock<Semaphore> = OnceLock::new();

/// Capacities for the two process-wide gates.
#[derive(Debug, Clone, Copy)]
pub struct GateCapacities {
    pub read: usize,
    pub process: usize,
}

impl GateCapacities {
    /// Capacities derived from platform CPU/IO budgets, the default used
    /// when the operator doesn't override them on the command line.
    pub fn default_for_platform() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        GateCapacities {
            read: cpus.max(1),
            process: cpus.max(1),
        }
    }
}

/// Initialize the global gates. Must be called at most once, before any
/// reader acquires a permit; subsequent calls are ignored.
pub fn init(capacities: GateCapacities) {
    let _ = READ_GATE.set(Semaphore::new(capacities.read.max(1)));
    let _ = PROCESS_GATE.set(Semaphore::new(capacities.process.max(1)));
}

fn read_gate() -> &'static Semaphore {
    READ_GATE.get_or_init(|| Semaphore::new(GateCapacities::default_for_platform().read))
}

fn process_gate() -> &'static Semaphore {
    PROCESS_GATE.get_or_init(|| Semaphore::new(GateCapacities::default_for_platform().process))
}

/// Acquire a permit on the read gate for the lifetime of the returned guard.
pub async fn acquire_read() -> SemaphorePermit<'static> {
    read_gate()
        .acquire()
        .await
        .expect("read gate semaphore is never closed")
}

/// Acquire a permit on the line-processing gate for the lifetime of the
/// returned guard.
pub async fn acquire_process() -> SemaphorePermit<'static> {
    process_gate()
        .acquire()
        .await
        .expect("process gate semaphore is never closed")
}
