//! Worker lifecycle: fork, supervise, classify the exit, restart after an
//! OOM kill, and never leak an un-reaped child.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use tracing::debug;

use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::support::{arm_parent_death_alarm, log_system_mem_info, mark_oom_killable};

/// How a supervised worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Normal termination with the given exit code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled(Signal),
    /// The wait itself failed; the child was force-killed and reaped.
    Lost,
}

/// Owned handle on a forked worker. Dropping an un-reaped handle kills and
/// reaps the child so no exit path leaks a zombie.
pub struct Worker {
    pid: Pid,
    reaped: bool,
}

impl Worker {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kill(&self, sig: Signal) {
        let _ = kill(self.pid, sig);
    }

    /// The supervisor already reaped this pid through another wait call.
    pub fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    /// Block until the worker terminates. `EINTR` is retried; any other
    /// wait failure escalates to SIGTERM, then SIGKILL, then one final
    /// reap, matching the "never leak a child" discipline.
    pub fn reap(&mut self, name: &str) -> WaitOutcome {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.reaped = true;
                    return WaitOutcome::Exited(code);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.reaped = true;
                    return WaitOutcome::Signaled(sig);
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!(name, pid = %self.pid, errno = %e, "waitpid failed, escalating");
                    self.kill(Signal::SIGTERM);
                    self.kill(Signal::SIGKILL);
                    let _ = waitpid(self.pid, None);
                    self.reaped = true;
                    return WaitOutcome::Lost;
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        self.kill(Signal::SIGKILL);
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
    }
}

/// Fork one worker running `body`.
///
/// Fork failure with `EAGAIN` is retried for as long as the run flag is
/// set; the kernel refusing with "try again" under load is the expected
/// condition for a stress tool, not an error. The child joins the run's
/// process group, arms the parent-death watchdog and makes itself a
/// preferred OOM target before running `body`, then `_exit`s with its
/// status without unwinding back into the caller's stack.
pub fn spawn_worker<F>(ctx: &RunContext, name: &str, body: F) -> Result<Worker>
where
    F: FnOnce() -> i32,
{
    loop {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = setpgid(Pid::from_raw(0), ctx.pgrp());
                arm_parent_death_alarm();
                mark_oom_killable(name, true);
                let code = body();
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                let _ = setpgid(child, ctx.pgrp());
                return Ok(Worker {
                    pid: child,
                    reaped: false,
                });
            }
            Err(Errno::EAGAIN) if ctx.running() => continue,
            Err(e) => return Err(Error::sys(name, "fork", e)),
        }
    }
}

/// Run `body` in a worker process, restarting it from scratch every time
/// it is killed with SIGKILL — taken to mean the OOM killer acted, which
/// for a memory stressor is routine, not failure. Any other signal ends
/// the run; so does a normal exit. Returns how many restarts happened.
pub fn supervise<F>(ctx: &RunContext, name: &str, instance: u32, mut body: F) -> Result<u32>
where
    F: FnMut() -> i32,
{
    let mut restarts = 0u32;
    loop {
        let mut worker = spawn_worker(ctx, name, &mut body)?;
        match worker.reap(name) {
            WaitOutcome::Exited(_) | WaitOutcome::Lost => return Ok(restarts),
            WaitOutcome::Signaled(sig) => {
                debug!(name, instance, signal = %sig, "child died");
                if sig == Signal::SIGKILL {
                    log_system_mem_info();
                    debug!(name, instance, "assuming killed by the OOM killer, restarting");
                    restarts += 1;
                    if ctx.running() {
                        continue;
                    }
                }
                return Ok(restarts);
            }
        }
    }
}

/// Fixed pool of workers spawned up front, as used by the multi-child
/// stressors. Shutdown is an immediate hard kill of every tracked pid:
/// once the cap or an external signal has fired there is nothing worth
/// being graceful about.
pub struct WorkerPool {
    name: String,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(name: &str) -> Self {
        WorkerPool {
            name: name.to_string(),
            workers: Vec::new(),
        }
    }

    pub fn spawn<F>(&mut self, ctx: &RunContext, body: F) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        let worker = spawn_worker(ctx, &self.name, body)?;
        let pid = worker.pid();
        self.workers.push(worker);
        Ok(pid)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Note that `pid` was already reaped by an external wait (e.g. a
    /// `waitpid(-1)` loop in the dispatcher).
    pub fn note_exited(&mut self, pid: Pid) {
        if let Some(pos) = self.workers.iter().position(|w| w.pid() == pid) {
            self.workers[pos].mark_reaped();
            self.workers.remove(pos);
        }
    }

    /// SIGKILL and reap every worker. Safe to call more than once.
    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.kill(Signal::SIGKILL);
            worker.reap(&self.name);
        }
        self.workers.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpgrp;

    #[test]
    fn worker_exit_code_is_reported() {
        let ctx = RunContext::new(getpgrp());
        let mut worker = spawn_worker(&ctx, "lifecycle-test", || 7).unwrap();
        assert_eq!(worker.reap("lifecycle-test"), WaitOutcome::Exited(7));
    }

    #[test]
    fn dropped_worker_is_killed_and_reaped() {
        let ctx = RunContext::new(getpgrp());
        let worker = spawn_worker(&ctx, "lifecycle-test", || {
            std::thread::sleep(std::time::Duration::from_secs(600));
            0
        })
        .unwrap();
        let pid = worker.pid();
        drop(worker);
        // The pid must be gone: a waitpid from here can only say ECHILD.
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
    }

    #[test]
    fn pool_shutdown_is_idempotent() {
        let ctx = RunContext::new(getpgrp());
        let mut pool = WorkerPool::new("pool-test");
        for _ in 0..3 {
            pool.spawn(&ctx, || {
                std::thread::sleep(std::time::Duration::from_secs(600));
                0
            })
            .unwrap();
        }
        assert_eq!(pool.len(), 3);
        pool.shutdown();
        assert!(pool.is_empty());
        pool.shutdown();
        assert!(pool.is_empty());
    }
}
