//! End-to-end runs of the stressors with real forked workers.

use nix::sys::signal::{raise, Signal};
use nix::unistd::{getpgrp, getpid};

use kstress::support::temp_dir_path;
use kstress::{
    spawn_worker, stress_malloc, stress_nice, stress_rmap, supervise, CounterPage, MallocConfig,
    RunContext, StressorArgs,
};

#[test]
fn counters_are_visible_across_fork() {
    let ctx = RunContext::new(getpgrp());
    let page = CounterPage::new(4).unwrap();
    let slot = page.slot(2);

    let mut worker = spawn_worker(&ctx, "counter-fork", || {
        for _ in 0..1000 {
            slot.inc();
        }
        0
    })
    .unwrap();
    worker.reap("counter-fork");

    assert_eq!(page.slot(2).get(), 1000);
    assert_eq!(page.sum(), 1000);
}

#[test]
fn malloc_run_reaches_exactly_the_cap() {
    let ctx = RunContext::new(getpgrp());
    let page = CounterPage::new(1).unwrap();
    let args = StressorArgs {
        counter: page.slot(0),
        instance: 0,
        max_ops: 50,
        name: "malloc",
    };
    let cfg = MallocConfig {
        max_bytes: 4096,
        table_size: 4,
        mmap_threshold: None,
    };

    stress_malloc(&args, &ctx, &cfg).unwrap();
    assert_eq!(page.slot(0).get(), 50);
}

#[test]
fn sigkilled_worker_is_restarted_exactly_once() {
    let ctx = RunContext::new(getpgrp());
    let page = CounterPage::new(2).unwrap();
    let attempts = page.slot(0);
    let completions = page.slot(1);

    let restarts = supervise(&ctx, "restart-test", 0, || {
        if attempts.get() == 0 {
            // First incarnation: simulate the OOM killer.
            attempts.inc();
            let _ = raise(Signal::SIGKILL);
        }
        completions.inc();
        0
    })
    .unwrap();

    assert_eq!(restarts, 1);
    assert_eq!(completions.get(), 1);
}

#[test]
fn stopped_context_ends_the_restart_loop() {
    let ctx = RunContext::new(getpgrp());
    let page = CounterPage::new(1).unwrap();
    let attempts = page.slot(0);

    // Every incarnation gets shot; only the run flag can end the loop.
    let stopper = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(150));
            ctx.stop();
        })
    };

    let restarts = supervise(&ctx, "restart-stop-test", 0, || {
        attempts.inc();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let _ = raise(Signal::SIGKILL);
        0
    })
    .unwrap();
    stopper.join().unwrap();

    assert!(restarts >= 1);
    assert!(attempts.get() >= 1);
}

#[test]
fn rmap_run_terminates_and_cleans_up() {
    let ctx = RunContext::new(getpgrp());
    let page = CounterPage::new(1).unwrap();
    let args = StressorArgs {
        counter: page.slot(0),
        instance: 77,
        max_ops: 64,
        name: "rmap",
    };

    stress_rmap(&args, &ctx).unwrap();
    assert!(page.slot(0).get() >= 64);
    assert!(!temp_dir_path("rmap", getpid(), 77).exists());
}

#[test]
fn nice_sweep_makes_progress() {
    let ctx = RunContext::new(getpgrp());
    let page = CounterPage::new(1).unwrap();
    let args = StressorArgs {
        counter: page.slot(0),
        instance: 0,
        max_ops: 1,
        name: "nice",
    };

    stress_nice(&args, &ctx).unwrap();
    // One outer iteration at most overshoots to the width of the nice
    // range; at least one priority in the sweep must have been accepted.
    let ops = page.slot(0).get();
    assert!(ops >= 1);
    assert!(ops <= 41);
}
