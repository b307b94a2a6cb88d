use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getpgrp, setpgid, Pid};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kstress::{
    install_stop_handler, stress_malloc, stress_nice, stress_rmap, stress_semaphore, CounterPage,
    Error, MallocConfig, Result, RunContext, Semaphore, StressorArgs, WorkerPool,
};

const MIN_MALLOC_BYTES: u64 = 1024;
const MAX_MALLOC_BYTES: u64 = 64 * 1024 * 1024 * 1024;
const MIN_MALLOC_MAX: u64 = 32;
const MAX_MALLOC_MAX: u64 = 256 * 1024 * 1024;
const MIN_MALLOC_THRESHOLD: u64 = 1;
const MAX_MALLOC_THRESHOLD: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StressorKind {
    /// Heap allocator churn.
    Malloc,
    /// Scheduler priority sweep.
    Nice,
    /// Virtual-memory reverse-mapping pressure.
    Rmap,
    /// Semaphore contention.
    Sem,
}

impl StressorKind {
    fn name(self) -> &'static str {
        match self {
            StressorKind::Malloc => "malloc",
            StressorKind::Nice => "nice",
            StressorKind::Rmap => "rmap",
            StressorKind::Sem => "sem",
        }
    }
}

#[derive(Parser)]
#[command(name = "kstress", about = "Stress Linux kernel subsystems from forked workers")]
struct Cli {
    /// Which stressor to run.
    #[arg(value_enum)]
    stressor: StressorKind,

    /// Stop each instance after this many operations (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    ops: u64,

    /// Stop the whole run after this many seconds (0 = no timeout).
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Number of stressor instances (default: one per CPU).
    #[arg(long)]
    instances: Option<u32>,

    /// Maximum single allocation for the malloc stressor (K/M/G suffixes).
    #[arg(long, default_value = "64M")]
    malloc_bytes: String,

    /// Number of concurrently tracked blocks in the malloc stressor.
    #[arg(long, default_value_t = 65536)]
    malloc_max: u64,

    /// Override the allocator's mmap threshold, in bytes.
    #[arg(long)]
    malloc_threshold: Option<u64>,

    /// Initial value of the run-wide semaphore for the sem stressor.
    #[arg(long, default_value_t = 1)]
    sem_value: u32,
}

/// Parse a byte count with an optional K/M/G suffix.
fn parse_bytes(input: &str) -> Result<u64> {
    let s = input.trim();
    let (digits, mult) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024u64),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits.parse().map_err(|_| Error::Config {
        option: format!("byte size '{input}'"),
        value: 0,
        min: MIN_MALLOC_BYTES,
        max: MAX_MALLOC_BYTES,
    })?;
    Ok(value * mult)
}

/// Abort configuration on out-of-range input, before any worker forks.
fn check_range(option: &str, value: u64, min: u64, max: u64) -> Result<u64> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(Error::Config {
            option: option.to_string(),
            value,
            min,
            max,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let malloc_cfg = MallocConfig {
        max_bytes: check_range(
            "malloc-bytes",
            parse_bytes(&cli.malloc_bytes)?,
            MIN_MALLOC_BYTES,
            MAX_MALLOC_BYTES,
        )? as usize,
        table_size: check_range("malloc-max", cli.malloc_max, MIN_MALLOC_MAX, MAX_MALLOC_MAX)?
            as usize,
        mmap_threshold: cli
            .malloc_threshold
            .map(|t| {
                check_range(
                    "malloc-threshold",
                    t,
                    MIN_MALLOC_THRESHOLD,
                    MAX_MALLOC_THRESHOLD,
                )
            })
            .transpose()?
            .map(|t| t as usize),
    };

    let instances = cli
        .instances
        .unwrap_or_else(|| num_cpus::get() as u32)
        .max(1);
    let kind = cli.stressor;
    let name = kind.name();

    // Lead a process group of our own so the shutdown broadcast reaches
    // exactly this run's workers.
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    let ctx = RunContext::new(getpgrp());
    install_stop_handler(&ctx, &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGALRM])?;

    if cli.timeout > 0 {
        unsafe { libc::alarm(cli.timeout as libc::c_uint) };
    }

    let counters = CounterPage::new(instances as usize)?;
    let semaphore = if kind == StressorKind::Sem {
        Some(Semaphore::new(cli.sem_value)?)
    } else {
        None
    };

    info!(stressor = name, instances, ops = cli.ops, timeout = cli.timeout, "starting");

    let mut pool = WorkerPool::new(name);
    for i in 0..instances {
        let slot = counters.slot(i as usize);
        let ctx_ref = &ctx;
        let cfg_ref = &malloc_cfg;
        let sem_ref = semaphore.as_ref();
        pool.spawn(ctx_ref, move || {
            let args = StressorArgs {
                counter: slot,
                instance: i,
                max_ops: cli.ops,
                name,
            };
            let outcome = match kind {
                StressorKind::Malloc => stress_malloc(&args, ctx_ref, cfg_ref),
                StressorKind::Nice => stress_nice(&args, ctx_ref),
                StressorKind::Rmap => stress_rmap(&args, ctx_ref),
                StressorKind::Sem => {
                    stress_semaphore(&args, ctx_ref, sem_ref.expect("semaphore initialised"))
                }
            };
            match outcome {
                Ok(()) => 0,
                Err(e) => {
                    error!("{e}");
                    1
                }
            }
        })?;
    }

    wait_for_instances(&ctx, &mut pool);

    info!(stressor = name, ops = counters.sum(), "run complete");
    Ok(())
}

/// Reap the instance processes. On a shutdown request the alarm only
/// reached this process, so broadcast it to the whole group and keep
/// waiting; the workers leave through their cooperative paths.
fn wait_for_instances(ctx: &RunContext, pool: &mut WorkerPool) {
    let mut broadcast = false;
    while !pool.is_empty() {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                pool.note_exited(pid);
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {
                if !ctx.running() && !broadcast {
                    broadcast = true;
                    let _ = killpg(ctx.pgrp(), Signal::SIGALRM);
                }
            }
            Err(_) => break,
        }
    }
    pool.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_accept_suffixes() {
        assert_eq!(parse_bytes("4096").unwrap(), 4096);
        assert_eq!(parse_bytes("4K").unwrap(), 4096);
        assert_eq!(parse_bytes("64M").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_bytes("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_bytes("lots").is_err());
    }

    #[test]
    fn out_of_range_options_are_rejected() {
        assert_eq!(check_range("opt", 50, 1, 100).unwrap(), 50);
        assert!(check_range("opt", 0, 1, 100).is_err());
        assert!(check_range("opt", 101, 1, 100).is_err());
    }
}
