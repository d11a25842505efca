// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run examples of chained tasks.

use clap::{Parser, ValueEnum};
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskchain::{
    BoxError, Context, CpuPinningPolicy, Future, TaskError, ThreadCount, WorkerPool,
    WorkerPoolBuilder,
};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let pool = WorkerPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        cpu_pinning: if cli.pin_threads {
            CpuPinningPolicy::IfSupported
        } else {
            CpuPinningPolicy::No
        },
    }
    .build();
    println!("pool = {pool:?}");

    let sleep = Duration::from_millis(cli.sleep_ms);
    let start = Instant::now();
    let result = match cli.scenario {
        Scenario::Run => run_scenario(&pool, cli.num_tasks, sleep),
        Scenario::DelayChain => delay_chain_scenario(&pool, cli.num_tasks, sleep),
        Scenario::Iterate => iterate_scenario(&pool, cli.num_tasks, sleep),
    };
    println!("elapsed = {:?}", start.elapsed());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error = {error:?}");
            ExitCode::FAILURE
        }
    }
}

/// Runs independent sleeping tasks, each with its own context, and joins them.
fn run_scenario(pool: &WorkerPool, num_tasks: usize, sleep: Duration) -> Result<(), TaskError> {
    let futures = (0..num_tasks)
        .map(|i| {
            let context = Context::empty().with("task", i);
            pool.run_with_context(context, move |context| {
                std::thread::sleep(sleep);
                let task = context.get::<usize>("task").copied();
                println!(
                    "task {task:?} done on {:?}",
                    std::thread::current().name().unwrap_or("<unnamed>")
                );
            })
        })
        .collect::<Vec<_>>();
    pool.when_all(futures).wait()
}

/// Chains timers, each link scheduling the next one without blocking.
fn delay_chain_scenario(
    pool: &WorkerPool,
    num_links: usize,
    sleep: Duration,
) -> Result<(), TaskError> {
    fn link(pool: WorkerPool, remaining: usize, sleep: Duration) -> Future {
        if remaining == 0 {
            return pool.run(|| println!("Hello, World!"));
        }
        pool.delay(sleep).then(move || {
            println!("{remaining} links remaining");
            link(pool, remaining - 1, sleep)
        })
    }

    link(pool.clone(), num_links, sleep).wait()
}

/// Drives a lazy sequence of asynchronous steps, one after the other.
fn iterate_scenario(
    pool: &WorkerPool,
    num_steps: usize,
    sleep: Duration,
) -> Result<(), TaskError> {
    let total = Arc::new(AtomicUsize::new(0));
    let steps = (0..num_steps).map({
        let pool = pool.clone();
        let total = total.clone();
        move |i| {
            let total = total.clone();
            Ok::<_, BoxError>(pool.delay(sleep).continue_with(move || {
                let sum = total.fetch_add(i, Ordering::SeqCst) + i;
                println!("step {i}: running sum = {sum}");
            }))
        }
    });
    pool.iterate(steps).wait()?;
    println!("sum = {}", total.load(Ordering::SeqCst));
    Ok(())
}

/// CLI tool to run examples of chained tasks.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Whether to pin worker threads to CPUs.
    #[arg(long, default_value_t = false)]
    pin_threads: bool,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of tasks (or chain links, or sequence steps) to run.
    #[arg(long, default_value_t = 100)]
    num_tasks: usize,

    /// Duration of each task's sleep (or timer), in milliseconds.
    #[arg(long, default_value_t = 20)]
    sleep_ms: u64,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Run sleeping tasks concurrently and wait for all of them.
    Run,
    /// Chain timers one after the other.
    DelayChain,
    /// Iterate over a lazy sequence of asynchronous steps.
    Iterate,
}
