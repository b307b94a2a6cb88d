//! Semaphore contention.
//!
//! Tight wait/post bursts against a run-wide process-shared semaphore.
//! The semaphore's lifecycle belongs to the caller; this stressor only
//! contends on it.

use tracing::debug;

use crate::context::{RunContext, StressorArgs};
use crate::error::Result;
use crate::sem::Semaphore;

/// Wait/post cycles per outer iteration.
const SEM_BURST: usize = 1000;

/// Semaphore contention stressor entry point.
pub fn stress_semaphore(args: &StressorArgs, ctx: &RunContext, sem: &Semaphore) -> Result<()> {
    loop {
        for _ in 0..SEM_BURST {
            if let Err(e) = sem.wait() {
                debug!(name = args.name, errno = %e, "sem_wait failed");
                break;
            }
            let _ = sem.post();
            if !ctx.running() {
                break;
            }
        }
        args.counter.inc();
        if !ctx.keep_stressing(args.counter.get(), args.max_ops) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::CounterPage;
    use nix::unistd::getpgrp;

    #[test]
    fn burst_count_matches_the_cap_and_value_is_restored() {
        let ctx = RunContext::new(getpgrp());
        let page = CounterPage::new(1).unwrap();
        let sem = Semaphore::new(1).unwrap();
        let args = StressorArgs {
            counter: page.slot(0),
            instance: 0,
            max_ops: 10,
            name: "sem",
        };

        stress_semaphore(&args, &ctx, &sem).unwrap();
        assert_eq!(page.slot(0).get(), 10);
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn shutdown_cuts_a_burst_short() {
        let ctx = RunContext::new(getpgrp());
        ctx.stop();
        let page = CounterPage::new(1).unwrap();
        let sem = Semaphore::new(1).unwrap();
        let args = StressorArgs {
            counter: page.slot(0),
            instance: 0,
            max_ops: 0,
            name: "sem",
        };

        // One burst is abandoned after a single cycle, then the outer
        // loop observes the cleared flag.
        stress_semaphore(&args, &ctx, &sem).unwrap();
        assert_eq!(page.slot(0).get(), 1);
        assert_eq!(sem.value().unwrap(), 1);
    }
}
