//! Host services the stressors rely on: page size, per-instance temp
//! directories, OOM-score adjustment and the orphaned-worker watchdog.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use sysinfo::System;
use tracing::debug;

use crate::error::{Error, Result};

pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// Path of the scratch directory for one stressor instance. Embedding the
/// pid keeps concurrent runs apart.
pub fn temp_dir_path(name: &str, pid: Pid, instance: u32) -> PathBuf {
    std::env::temp_dir().join(format!(".{name}-{pid}-{instance}"))
}

/// Per-instance scratch directory, removed on drop. Removal is idempotent
/// so both the explicit cleanup path and the drop may run.
pub struct TempDir {
    path: PathBuf,
    removed: bool,
}

impl TempDir {
    pub fn create(name: &str, pid: Pid, instance: u32) -> Result<Self> {
        let path = temp_dir_path(name, pid, instance);
        let mut builder = fs::DirBuilder::new();
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&path)
            .map_err(|e| Error::io(name, "mkdir", e))?;
        Ok(TempDir {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name inside the directory, salted with a random tag so retried
    /// instances never collide.
    pub fn filename(&self, name: &str, pid: Pid, instance: u32, tag: u32) -> PathBuf {
        self.path.join(format!("{name}-{pid}-{instance}-{tag:08x}"))
    }

    pub fn remove(&mut self) -> io::Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        match fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

/// Make the calling process a preferred (or protected) target for the
/// kernel's OOM killer. Failure is logged, not fatal: an unprivileged
/// process may always raise its own score but not everyone can lower it.
pub fn mark_oom_killable(name: &str, killable: bool) {
    let score = if killable { "1000" } else { "0" };
    if fs::write("/proc/self/oom_score_adj", score).is_ok() {
        return;
    }
    // Fall back to the legacy knob on old kernels.
    let adj = if killable { "15" } else { "0" };
    if let Err(e) = fs::write("/proc/self/oom_adj", adj) {
        debug!(name, error = %e, "cannot adjust OOM score");
    }
}

/// Arm the parent-death watchdog: if the supervising process dies first,
/// the kernel delivers SIGALRM here so the orphan stops itself.
pub fn arm_parent_death_alarm() {
    if let Err(e) = prctl::set_pdeathsig(Signal::SIGALRM) {
        debug!(error = %e, "cannot arm parent death signal");
    }
}

/// Dump current memory figures, called when a worker is presumed to have
/// been shot by the OOM killer.
pub fn log_system_mem_info() {
    let mut sys = System::new();
    sys.refresh_memory();
    debug!(
        total = sys.total_memory(),
        used = sys.used_memory(),
        free = sys.free_memory(),
        swap_total = sys.total_swap(),
        swap_used = sys.used_swap(),
        "system memory"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn temp_dir_remove_is_idempotent() {
        let mut dir = TempDir::create("tmptest", getpid(), 901).unwrap();
        assert!(dir.path().is_dir());
        dir.remove().unwrap();
        assert!(!dir.path().exists());
        // Second removal (and the drop after that) must be a no-op.
        dir.remove().unwrap();
    }

    #[test]
    fn temp_filename_lives_under_the_dir() {
        let pid = getpid();
        let mut dir = TempDir::create("tmptest", pid, 902).unwrap();
        let file = dir.filename("tmptest", pid, 902, 0xdead_beef);
        assert!(file.starts_with(dir.path()));
        dir.remove().unwrap();
    }

    #[test]
    fn page_size_is_sane() {
        let page = page_size();
        assert!(page >= 1024);
        assert!(page.is_power_of_two());
    }
}
