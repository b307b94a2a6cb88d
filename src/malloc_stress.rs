//! Heap allocator churn.
//!
//! A forked worker keeps a fixed table of live blocks and, per iteration,
//! picks a random slot and either frees, reallocates or allocates it,
//! touching every resident page of a successful allocation. The worker is
//! the preferred OOM target; when the kernel shoots it, the supervisor
//! forks a fresh one and keeps going.

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tracing::debug;

use crate::context::{RunContext, StressorArgs};
use crate::counter::Counter;
use crate::error::Result;
use crate::lifecycle::supervise;
use crate::support::page_size;

pub const DEFAULT_MALLOC_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MALLOC_MAX: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct MallocConfig {
    /// Upper bound on a single allocation, in bytes.
    pub max_bytes: usize,
    /// Number of concurrently tracked blocks.
    pub table_size: usize,
    /// Override for the allocator's mmap threshold, where supported.
    pub mmap_threshold: Option<usize>,
}

impl Default for MallocConfig {
    fn default() -> Self {
        MallocConfig {
            max_bytes: DEFAULT_MALLOC_BYTES,
            table_size: DEFAULT_MALLOC_MAX,
            mmap_threshold: None,
        }
    }
}

/// One live heap block, freed on drop.
struct Block {
    ptr: *mut u8,
    len: usize,
}

impl Block {
    fn alloc(len: usize) -> Option<Block> {
        let ptr = unsafe { libc::malloc(len) } as *mut u8;
        if ptr.is_null() {
            None
        } else {
            Some(Block { ptr, len })
        }
    }

    /// Counted zeroed allocation: `n` chunks of `chunk` bytes.
    fn calloc(n: usize, chunk: usize) -> Option<Block> {
        let ptr = unsafe { libc::calloc(n, chunk) } as *mut u8;
        if ptr.is_null() {
            None
        } else {
            Some(Block {
                ptr,
                len: n * chunk,
            })
        }
    }

    /// Resize in place where possible. On failure the original block is
    /// returned untouched and stays live.
    fn realloc(mut self, len: usize) -> std::result::Result<Block, Block> {
        let new = unsafe { libc::realloc(self.ptr as *mut libc::c_void, len) } as *mut u8;
        if new.is_null() {
            Err(self)
        } else {
            self.ptr = new;
            self.len = len;
            Ok(self)
        }
    }

    /// Fault in every page of the block without altering its contents.
    fn touch(&self, page: usize) {
        let mut off = 0;
        while off < self.len {
            unsafe {
                let p = self.ptr.add(off);
                p.write_volatile(p.read_volatile());
            }
            off += page;
        }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr as *mut libc::c_void) };
    }
}

/// Fixed-size table of nullable block slots, fully drained before the
/// worker exits on every path.
pub(crate) struct AllocTable {
    slots: Vec<Option<Block>>,
}

impl AllocTable {
    fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        AllocTable { slots }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn take(&mut self, i: usize) -> Option<Block> {
        self.slots[i].take()
    }

    fn put(&mut self, i: usize, block: Block) {
        self.slots[i] = Some(block);
    }

    pub(crate) fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn drain(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

fn alloc_size(rng: &mut SmallRng, max_bytes: usize) -> usize {
    let len = rng.next_u64() as usize % max_bytes.max(1);
    len.max(1)
}

/// Inner worker loop. Bails out of the iteration as soon as the run flag
/// clears; the caller still drains the table afterwards.
pub(crate) fn malloc_churn(
    table: &mut AllocTable,
    ctx: &RunContext,
    counter: Counter<'_>,
    max_ops: u64,
    cfg: &MallocConfig,
    rng: &mut SmallRng,
) {
    let page = page_size();
    loop {
        // With many instances running, process start-up can lag; check the
        // flag before exerting any more memory pressure.
        if !ctx.running() {
            return;
        }

        let rnd = rng.next_u32();
        let i = rnd as usize % table.len();
        let action = (rnd >> 12) & 1 == 1;
        let do_calloc = (rnd >> 14) & 0x1f;

        if let Some(block) = table.take(i) {
            if action {
                // 50% free, 50% realloc.
                drop(block);
                counter.inc();
            } else {
                let len = alloc_size(rng, cfg.max_bytes);
                match block.realloc(len) {
                    Ok(resized) => {
                        resized.touch(page);
                        table.put(i, resized);
                        counter.inc();
                    }
                    Err(original) => table.put(i, original),
                }
            }
        } else if action {
            // Empty slot: 50% leave it, 50% allocate. Roughly 1 in 32
            // allocations goes through the counted/zeroed path instead.
            let len = alloc_size(rng, cfg.max_bytes);
            let block = if do_calloc == 0 {
                let n = ((rnd >> 15) % 17) as usize + 1;
                Block::calloc(n, len / n)
            } else {
                Block::alloc(len)
            };
            if let Some(block) = block {
                block.touch(page);
                table.put(i, block);
                counter.inc();
            }
        }

        if !ctx.keep_stressing(counter.get(), max_ops) {
            return;
        }
    }
}

/// Allocator churn stressor entry point.
pub fn stress_malloc(args: &StressorArgs, ctx: &RunContext, cfg: &MallocConfig) -> Result<()> {
    #[cfg(target_env = "gnu")]
    if let Some(threshold) = cfg.mmap_threshold {
        unsafe { libc::mallopt(libc::M_MMAP_THRESHOLD, threshold as libc::c_int) };
    }

    let restarts = supervise(ctx, args.name, args.instance, || {
        let mut table = AllocTable::new(cfg.table_size);
        let mut rng = SmallRng::from_os_rng();
        malloc_churn(&mut table, ctx, args.counter, args.max_ops, cfg, &mut rng);
        table.drain();
        0
    })?;

    if restarts > 0 {
        debug!(name = args.name, restarts, "OOM restarts");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterPage;
    use nix::unistd::getpgrp;

    fn small_cfg() -> MallocConfig {
        MallocConfig {
            max_bytes: 4096,
            table_size: 4,
            mmap_threshold: None,
        }
    }

    #[test]
    fn alloc_size_is_never_zero() {
        let mut rng = SmallRng::from_os_rng();
        for _ in 0..10_000 {
            let len = alloc_size(&mut rng, 4096);
            assert!((1..4096).contains(&len));
        }
        assert_eq!(alloc_size(&mut rng, 1), 1);
    }

    #[test]
    fn churn_stops_at_the_cap_and_table_drains() {
        let ctx = RunContext::new(getpgrp());
        let page = CounterPage::new(1).unwrap();
        let counter = page.slot(0);
        let cfg = small_cfg();

        let mut table = AllocTable::new(cfg.table_size);
        let mut rng = SmallRng::from_os_rng();
        malloc_churn(&mut table, &ctx, counter, 50, &cfg, &mut rng);
        assert_eq!(counter.get(), 50);

        table.drain();
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn shutdown_aborts_before_allocating() {
        let ctx = RunContext::new(getpgrp());
        ctx.stop();
        let page = CounterPage::new(1).unwrap();
        let cfg = small_cfg();

        let mut table = AllocTable::new(cfg.table_size);
        let mut rng = SmallRng::from_os_rng();
        malloc_churn(&mut table, &ctx, page.slot(0), 0, &cfg, &mut rng);
        assert_eq!(page.slot(0).get(), 0);
        // The drain still runs on the abort path.
        table.drain();
        assert_eq!(table.live(), 0);
    }

    #[test]
    fn realloc_failure_keeps_the_original_block() {
        // A request the allocator cannot satisfy: realloc must hand the
        // original block back untouched.
        let block = Block::alloc(64).unwrap();
        let old_ptr = block.ptr;
        match block.realloc(usize::MAX / 2) {
            Ok(_) => panic!("absurd realloc unexpectedly succeeded"),
            Err(original) => {
                assert_eq!(original.ptr, old_ptr);
                assert_eq!(original.len, 64);
            }
        }
    }
}
