//! Scheduler priority sweep.
//!
//! Each outer iteration forks a throwaway child that walks the whole legal
//! nice range, re-nicing itself one step at a time and burning CPU for a
//! fixed hold at every priority it manages to reach.

use std::time::{Duration, Instant};

use nix::sys::resource::{getrlimit, Resource};

use crate::context::{RunContext, StressorArgs};
use crate::error::{Error, Result};
use crate::lifecycle::spawn_worker;

/// How long a child busy-waits at each accepted priority.
const PRIORITY_HOLD: Duration = Duration::from_millis(100);

/// Legal nice range derived from the soft RLIMIT_NICE value:
/// the ceiling is `20 - rlim_cur`, the floor its negation.
pub fn nice_range(rlim_cur: u64) -> (i32, i32) {
    let max = 20 - rlim_cur.min(40) as i32;
    (-max, max)
}

fn busy_wait(hold: Duration) {
    let start = Instant::now();
    while start.elapsed() < hold {
        std::hint::spin_loop();
    }
}

/// Priority sweep stressor entry point.
pub fn stress_nice(args: &StressorArgs, ctx: &RunContext) -> Result<()> {
    let (soft, _hard) = getrlimit(Resource::RLIMIT_NICE)
        .map_err(|e| Error::sys(args.name, "getrlimit", e))?;
    let (mut min_prio, mut max_prio) = nice_range(soft);
    if min_prio > max_prio {
        // An unbounded rlimit yields an inverted range; sweeping the
        // current priority alone still makes progress.
        (min_prio, max_prio) = (0, 0);
    }
    let counter = args.counter;

    while ctx.keep_stressing(counter.get(), args.max_ops) {
        let mut worker = spawn_worker(ctx, args.name, || {
            let pid = unsafe { libc::getpid() } as libc::id_t;
            for prio in min_prio..=max_prio {
                // Unprivileged processes cannot lower their nice value, so
                // some of the sweep is expected to be refused; only count
                // the priorities actually reached.
                if unsafe { libc::setpriority(libc::PRIO_PROCESS, pid, prio) } == 0 {
                    busy_wait(PRIORITY_HOLD);
                    counter.inc();
                }
            }
            0
        })?;
        worker.reap(args.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_range_is_symmetric() {
        assert_eq!(nice_range(0), (-20, 20));
        assert_eq!(nice_range(5), (-15, 15));
        assert_eq!(nice_range(20), (0, 0));
    }

    #[test]
    fn nice_range_handles_unbounded_rlimit() {
        // RLIM_INFINITY must not wrap the arithmetic; the resulting range
        // is simply empty.
        let (min, max) = nice_range(u64::MAX);
        assert!(min > max);
    }
}
