//! Reverse-mapping (rmap) pressure.
//!
//! One backing file is mapped 64 times at page offsets 0, 1, 2, ... so
//! every 16-page window overlaps the tail of the previous one, with an
//! anonymous padding page squeezed between the windows to keep the address
//! space fragmented:
//!
//! ```text
//!   [ window 0          ]
//!   [ page ][ window 1          ]
//!   [ page ][ page ][ window 2          ]
//!
//!   file size = (64 - 1 + 16) * page_size
//! ```
//!
//! Sixteen children hammer the shared windows concurrently, which forces
//! the kernel to walk long reverse-mapping chains on every writeback and
//! reclaim decision. Data integrity is explicitly not a goal here; the
//! unsynchronised shared writes are the point.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::Signal;
use nix::unistd::{getpid, pipe, read, write};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use tracing::debug;

use crate::context::{install_stop_handler, RunContext, StressorArgs};
use crate::counter::{Counter, CounterPage};
use crate::error::{Error, Result};
use crate::lifecycle::WorkerPool;
use crate::support::{mark_oom_killable, page_size, TempDir};

const RMAP_CHILD_MAX: usize = 16;
const MAPPINGS_MAX: usize = 64;
const MAPPING_PAGES: usize = 16;

/// How often the supervisor re-sums the per-child counters when no child
/// has signalled through the wakeup pipe.
const SUPERVISOR_TICK: u16 = 100;

/// Size of the backing file needed for the overlapping window layout.
pub fn backing_file_len(page_size: usize) -> usize {
    ((MAPPINGS_MAX - 1) + MAPPING_PAGES) * page_size
}

/// The overlapping shared windows plus their padding pages. All mappings
/// are released on drop, so any failure path past construction unmaps
/// whatever was established.
struct SharedMappings {
    windows: Vec<*mut u8>,
    paddings: Vec<*mut u8>,
    window_len: usize,
    page: usize,
}

impl SharedMappings {
    fn map(name: &str, file: &File, page: usize) -> Result<Self> {
        let window_len = MAPPING_PAGES * page;
        let mut maps = SharedMappings {
            windows: Vec::with_capacity(MAPPINGS_MAX),
            paddings: Vec::with_capacity(MAPPINGS_MAX),
            window_len,
            page,
        };

        for i in 0..MAPPINGS_MAX {
            let offset = (i * page) as libc::off_t;
            let window = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    window_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    offset,
                )
            };
            if window == libc::MAP_FAILED {
                return Err(Error::sys(name, "mmap", Errno::last()));
            }
            maps.windows.push(window as *mut u8);

            // Squeeze at least a page in between each window.
            let padding = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    page,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if padding == libc::MAP_FAILED {
                return Err(Error::sys(name, "mmap", Errno::last()));
            }
            maps.paddings.push(padding as *mut u8);
        }
        Ok(maps)
    }

    fn window(&self, i: usize) -> *mut u8 {
        self.windows[i]
    }

    fn fill(&self, i: usize, byte: u8, sync_flag: libc::c_int) {
        unsafe {
            std::ptr::write_bytes(self.window(i), byte, self.window_len);
            libc::msync(
                self.window(i) as *mut libc::c_void,
                self.window_len,
                sync_flag,
            );
        }
    }

    /// Sliding block copy from window `from` into window `to`. The windows
    /// alias the same file pages at different addresses, so this is a
    /// memmove, never assumed disjoint.
    fn copy(&self, to: usize, from: usize, sync_flag: libc::c_int) {
        unsafe {
            std::ptr::copy(self.window(from), self.window(to), self.window_len);
            libc::msync(
                self.window(to) as *mut libc::c_void,
                self.window_len,
                sync_flag,
            );
        }
    }
}

impl Drop for SharedMappings {
    fn drop(&mut self) {
        unsafe {
            for window in self.windows.drain(..) {
                libc::munmap(window as *mut libc::c_void, self.window_len);
            }
            for padding in self.paddings.drain(..) {
                libc::munmap(padding as *mut libc::c_void, self.page);
            }
        }
    }
}

/// Reserve `len` bytes of real file space, so later page faults through
/// the mappings cannot fail with SIGBUS.
fn allocate_backing(name: &str, file: &File, len: usize) -> Result<()> {
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    if rc != 0 {
        return Err(Error::sys(name, "posix_fallocate", Errno::from_raw(rc)));
    }
    Ok(())
}

/// Create the backing file and immediately unlink it, so its space is
/// reclaimed on last close no matter how the run ends.
fn create_unlinked_file(name: &str, path: &Path, len: usize) -> Result<File> {
    let file = {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| Error::io(name, "open", e))?
    };
    std::fs::remove_file(path).map_err(|e| Error::io(name, "unlink", e))?;
    allocate_backing(name, &file, len)?;
    Ok(file)
}

fn rmap_child(
    counter: Counter<'_>,
    max_ops: u64,
    maps: &SharedMappings,
    ctx: &RunContext,
    wake: &OwnedFd,
) -> i32 {
    let mut rng = SmallRng::from_os_rng();

    loop {
        // Mostly asynchronous flushes, with the occasional synchronous one.
        let sync_flag = if rng.next_u32() as u8 != 0 {
            libc::MS_ASYNC
        } else {
            libc::MS_SYNC
        };

        match rng.next_u32() & 3 {
            0 => {
                // Forward sweep.
                for i in 0..MAPPINGS_MAX {
                    if !ctx.running() {
                        break;
                    }
                    maps.fill(i, rng.next_u32() as u8, sync_flag);
                }
            }
            1 => {
                // Backward sweep.
                for i in (0..MAPPINGS_MAX).rev() {
                    if !ctx.running() {
                        break;
                    }
                    maps.fill(i, rng.next_u32() as u8, sync_flag);
                }
            }
            2 => {
                // Random single-window touches.
                for _ in 0..MAPPINGS_MAX {
                    if !ctx.running() {
                        break;
                    }
                    let j = rng.next_u32() as usize % MAPPINGS_MAX;
                    maps.fill(j, rng.next_u32() as u8, sync_flag);
                }
            }
            _ => {
                // Sliding copy into the previous window.
                for i in 0..MAPPINGS_MAX - 1 {
                    if !ctx.running() {
                        break;
                    }
                    maps.copy(i, i + 1, sync_flag);
                }
            }
        }

        counter.inc();
        if !ctx.keep_stressing(counter.get(), max_ops) {
            break;
        }
    }

    // Wake the supervisor for a final counter sweep before exiting.
    let _ = write(wake.as_fd(), &[1u8]);
    0
}

/// Reverse-mapping pressure stressor entry point.
pub fn stress_rmap(args: &StressorArgs, ctx: &RunContext) -> Result<()> {
    let name = args.name;
    let page = page_size();
    let mypid = getpid();
    let mut rng = SmallRng::from_os_rng();

    let counters = CounterPage::new(RMAP_CHILD_MAX)?;
    mark_oom_killable(name, true);

    let mut dir = TempDir::create(name, mypid, args.instance)?;
    let path = dir.filename(name, mypid, args.instance, rng.next_u32());
    let file = create_unlinked_file(name, &path, backing_file_len(page))?;
    let maps = SharedMappings::map(name, &file, page)?;

    // Children inherit the handler: on SIGALRM (shutdown, or this process
    // dying first) they clear their run flag and leave through the normal
    // exit path, which reports back through the wakeup pipe.
    install_stop_handler(ctx, &[Signal::SIGALRM])?;
    let (wake_rd, wake_wr) = pipe().map_err(|e| Error::sys(name, "pipe", e))?;

    let per_child_ops = if args.max_ops == 0 {
        0
    } else {
        args.max_ops / RMAP_CHILD_MAX as u64
    };

    let mut pool = WorkerPool::new(name);
    for i in 0..RMAP_CHILD_MAX {
        let slot = counters.slot(i);
        let maps_ref = &maps;
        let wake_ref = &wake_wr;
        pool.spawn(ctx, move || {
            rmap_child(slot, per_child_ops, maps_ref, ctx, wake_ref)
        })?;
    }
    // Close the parent's write end: once every child is gone the read end
    // reports hangup and the supervisor stops waiting for progress.
    drop(wake_wr);

    let mut last_sum = 0u64;
    let mut buf = [0u8; 64];
    while ctx.keep_stressing(args.counter.get(), args.max_ops) {
        let mut all_children_gone = false;
        {
            let mut fds = [PollFd::new(wake_rd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(SUPERVISOR_TICK)) {
                Ok(n) if n > 0 => {
                    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
                    if revents.contains(PollFlags::POLLIN) {
                        let _ = read(wake_rd.as_fd(), &mut buf);
                    }
                    all_children_gone = revents.contains(PollFlags::POLLHUP);
                }
                Ok(_) => {}
                Err(Errno::EINTR) => {}
                Err(e) => {
                    debug!(name, errno = %e, "poll failed");
                    break;
                }
            }
        }

        let total = counters.sum();
        args.counter.add(total - last_sum);
        last_sum = total;

        if all_children_gone {
            break;
        }
    }

    // Catch increments between the last sweep and the loop exit.
    let total = counters.sum();
    args.counter.add(total - last_sum);

    pool.shutdown();
    dir.remove().map_err(|e| Error::io(name, "rmdir", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_file_holds_all_overlapping_windows() {
        let page = page_size();
        assert_eq!(backing_file_len(page), (64 - 1 + 16) * page);
    }

    #[test]
    fn backing_file_is_sized_before_unlink() {
        let page = page_size();
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("rmap-backing");

        // Same create/fallocate sequence as the stressor, minus the
        // unlink, so the size is observable by path.
        let file = {
            use std::os::unix::fs::OpenOptionsExt;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)
                .unwrap()
        };
        allocate_backing("rmap-test", &file, backing_file_len(page)).unwrap();
        let observed = std::fs::metadata(&path).unwrap().len();
        assert_eq!(observed, backing_file_len(page) as u64);
    }

    #[test]
    fn unlinked_file_leaves_no_name_behind() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("rmap-unlinked");
        let file = create_unlinked_file("rmap-test", &path, page_size()).unwrap();
        assert!(!path.exists());
        // The open handle still works after the unlink.
        assert_eq!(file.metadata().unwrap().len(), page_size() as u64);
    }
}
