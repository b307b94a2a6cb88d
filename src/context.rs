//! Run-wide shutdown state shared by every stressor.
//!
//! The run flag lives in an `Arc<AtomicBool>` owned by the dispatcher and
//! handed to each stressor through a [`RunContext`]. Forked workers carry
//! their own copy-on-write clone of the flag; the signal handler installed
//! by [`install_stop_handler`] is inherited across fork and clears the copy
//! belonging to whichever process receives the signal, so every worker
//! observes shutdown independently.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use crate::counter::Counter;
use crate::error::{Error, Result};

/// Shutdown flag plus the process group all workers of a run join.
#[derive(Clone)]
pub struct RunContext {
    run: Arc<AtomicBool>,
    pgrp: Pid,
}

impl RunContext {
    pub fn new(pgrp: Pid) -> Self {
        RunContext {
            run: Arc::new(AtomicBool::new(true)),
            pgrp,
        }
    }

    /// True until shutdown has been requested.
    pub fn running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Request cooperative shutdown of this process's workers.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    pub fn pgrp(&self) -> Pid {
        self.pgrp
    }

    /// Loop guard every worker re-evaluates each iteration: keep going
    /// while the run flag is set and the operation cap (0 = unbounded)
    /// has not been reached.
    pub fn keep_stressing(&self, ops: u64, max_ops: u64) -> bool {
        self.running() && (max_ops == 0 || ops < max_ops)
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.run)
    }
}

/// Immutable per-invocation arguments the dispatcher hands to a stressor.
#[derive(Clone, Copy)]
pub struct StressorArgs<'a> {
    /// Progress counter slot owned by the dispatcher, shared across fork.
    pub counter: Counter<'a>,
    /// Instance index of this stressor within the run.
    pub instance: u32,
    /// Operation cap; 0 means unbounded.
    pub max_ops: u64,
    /// Display name used in every log line.
    pub name: &'a str,
}

// The handler can only reach the flag through a static slot. The slot holds
// a leaked strong reference so the pointed-to atomic stays valid even if the
// registering context is dropped; re-registration swaps the pointer and
// deliberately leaks the previous reference (one word per run, at most).
static STOP_SLOT: AtomicPtr<AtomicBool> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn stop_handler(_sig: libc::c_int) {
    let flag = STOP_SLOT.load(Ordering::SeqCst);
    if !flag.is_null() {
        // Plain atomic store, async-signal-safe.
        unsafe { (*flag).store(false, Ordering::SeqCst) };
    }
}

/// Install a handler for each of `signals` that clears the context's run
/// flag. No `SA_RESTART`: blocking waits must come back with `EINTR` so the
/// supervisor notices the shutdown request.
pub fn install_stop_handler(ctx: &RunContext, signals: &[Signal]) -> Result<()> {
    let raw = Arc::into_raw(ctx.flag()) as *mut AtomicBool;
    STOP_SLOT.swap(raw, Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(stop_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in signals {
        unsafe { sigaction(*sig, &action) }
            .map_err(|e| Error::sys("stop-handler", "sigaction", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpgrp;

    #[test]
    fn keep_stressing_honours_flag_and_cap() {
        let ctx = RunContext::new(getpgrp());
        assert!(ctx.keep_stressing(0, 0));
        assert!(ctx.keep_stressing(99, 100));
        assert!(!ctx.keep_stressing(100, 100));
        assert!(!ctx.keep_stressing(101, 100));

        ctx.stop();
        assert!(!ctx.keep_stressing(0, 0));
        assert!(!ctx.keep_stressing(0, 100));
    }

    #[test]
    fn stop_is_visible_through_clones() {
        let ctx = RunContext::new(getpgrp());
        let clone = ctx.clone();
        clone.stop();
        assert!(!ctx.running());
    }
}
