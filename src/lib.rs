//! Process-based stress harness for Linux kernel subsystems.
//!
//! Each stressor drives one subsystem — the heap allocator, scheduler
//! priorities, virtual-memory reverse mapping, or semaphore contention —
//! to its limits from one or more forked worker processes. Workers report
//! progress through counters in shared memory, stop cooperatively on a
//! run flag cleared by signal, and are restarted from scratch when the
//! kernel's OOM killer takes one down. Every exit path reaps its children
//! and removes its temp files.

pub mod context;
pub mod counter;
pub mod error;
pub mod lifecycle;
pub mod sem;
pub mod support;

pub mod malloc_stress;
pub mod nice_stress;
pub mod rmap_stress;
pub mod sem_stress;

pub use context::{install_stop_handler, RunContext, StressorArgs};
pub use counter::{Counter, CounterPage};
pub use error::{Error, Result};
pub use lifecycle::{spawn_worker, supervise, WaitOutcome, Worker, WorkerPool};
pub use sem::Semaphore;

pub use malloc_stress::{stress_malloc, MallocConfig};
pub use nice_stress::stress_nice;
pub use rmap_stress::stress_rmap;
pub use sem_stress::stress_semaphore;
