//! Progress counters shared across the fork boundary.
//!
//! A [`CounterPage`] is an anonymous `MAP_SHARED` mapping holding one
//! `AtomicU64` per worker slot. Each worker increments only its own slot
//! and the supervisor reads all of them, so relaxed atomics are enough;
//! the values are a progress signal, not a correctness gate.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::support::page_size;

pub struct CounterPage {
    base: NonNull<AtomicU64>,
    slots: usize,
    map_len: usize,
}

// The mapping holds atomics only and slot ownership is by convention
// (single writer per slot), so handing references across threads is fine.
unsafe impl Send for CounterPage {}
unsafe impl Sync for CounterPage {}

impl CounterPage {
    /// Map a zeroed shared page holding `slots` counters, rounded up to a
    /// whole number of pages.
    pub fn new(slots: usize) -> Result<Self> {
        let page = page_size();
        let want = slots.max(1) * std::mem::size_of::<AtomicU64>();
        let map_len = want.div_ceil(page) * page;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::sys("shared-counters", "mmap", Errno::last()));
        }
        Ok(CounterPage {
            base: NonNull::new(ptr as *mut AtomicU64).expect("mmap returned null"),
            slots: slots.max(1),
            map_len,
        })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Handle on one counter slot. Panics on an out-of-range index, which
    /// is a caller bug, not a runtime condition.
    pub fn slot(&self, index: usize) -> Counter<'_> {
        assert!(index < self.slots, "counter slot {index} out of range");
        Counter {
            cell: unsafe { &*self.base.as_ptr().add(index) },
        }
    }

    /// Opportunistic sum over all slots; may interleave arbitrarily with
    /// writer updates.
    pub fn sum(&self) -> u64 {
        (0..self.slots).map(|i| self.slot(i).get()).sum()
    }
}

impl Drop for CounterPage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

/// Writer/reader handle on a single slot: increment-only on the worker
/// side, plain reads on the supervisor side.
#[derive(Clone, Copy)]
pub struct Counter<'a> {
    cell: &'a AtomicU64,
}

impl Counter<'_> {
    pub fn inc(&self) {
        self.cell.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        if n > 0 {
            self.cell.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_zeroed_and_count_up() {
        let page = CounterPage::new(4).unwrap();
        assert_eq!(page.sum(), 0);

        page.slot(0).inc();
        page.slot(3).add(41);
        assert_eq!(page.slot(0).get(), 1);
        assert_eq!(page.slot(3).get(), 41);
        assert_eq!(page.sum(), 42);
    }

    #[test]
    fn mapping_is_page_aligned() {
        let page = CounterPage::new(1).unwrap();
        assert_eq!(page.base.as_ptr() as usize % page_size(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_slot_panics() {
        let page = CounterPage::new(2).unwrap();
        let _ = page.slot(2);
    }
}
