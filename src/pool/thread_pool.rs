// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of worker threads draining a shared work queue.

use crate::context::Context;
use crate::error::panic_message;
use crate::future::Future;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_channel::{unbounded, Receiver, Sender};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

/// Number of threads to spawn in a worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a worker pool will panic.
    Always,
}

/// A builder for [`WorkerPool`].
#[derive(Clone, Copy, Debug)]
pub struct WorkerPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for WorkerPoolBuilder {
    /// The configuration of the [global](WorkerPool::global) pool: one thread
    /// per available CPU, without pinning.
    fn default() -> Self {
        Self {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl WorkerPoolBuilder {
    /// Spawns a worker pool.
    ///
    /// ```
    /// # use taskchain::{CpuPinningPolicy, ThreadCount, WorkerPoolBuilder};
    /// let pool = WorkerPoolBuilder {
    ///     num_threads: ThreadCount::try_from(2).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let futures = (0..10).map(|_| pool.run(|| ())).collect::<Vec<_>>();
    /// pool.when_all(futures).wait().unwrap();
    /// ```
    pub fn build(&self) -> WorkerPool {
        WorkerPool::new(self)
    }
}

/// A callback queued on a [`WorkerPool`].
pub(crate) type Job = Box<dyn FnOnce(&Context) + Send + 'static>;

/// A callback together with the context it must run in.
pub(crate) struct WorkItem {
    job: Job,
    context: Option<Context>,
}

impl WorkItem {
    /// Runs the callback, then drops the context so that nothing of it remains
    /// on this worker for the next item.
    fn execute(self) {
        match self.context {
            Some(context) => (self.job)(&context),
            None => (self.job)(&Context::empty()),
        }
    }
}

/// A fixed set of background threads executing queued callbacks.
///
/// The queue is unbounded: submitting never blocks nor fails. Handles are
/// cheap to clone and all refer to the same threads. The threads of the
/// [global](Self::global) pool live for the whole process, without preventing
/// it from exiting. The threads of a pool created with [`WorkerPoolBuilder`]
/// exit once every handle to it has been dropped and the queue is drained.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Producer side of the work queue.
    sender: Sender<WorkItem>,
    /// Number of worker threads that were spawned.
    num_threads: NonZeroUsize,
}

static GLOBAL_POOL: OnceLock<WorkerPool> = OnceLock::new();

impl WorkerPool {
    /// Creates a new worker pool using the given parameters.
    fn new(builder: &WorkerPoolBuilder) -> Self {
        let num_threads = builder.num_threads.count();
        let cpu_pinning = builder.cpu_pinning;
        let (sender, receiver) = unbounded();

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        for id in 0..num_threads.get() {
            let worker = Worker {
                id,
                receiver: receiver.clone(),
            };
            std::thread::Builder::new()
                .name(format!("taskchain-worker-{id}"))
                .spawn(move || {
                    pin_current_thread(id, cpu_pinning);
                    worker.run()
                })
                .expect("Failed to spawn a worker thread");
        }
        log_debug!("[pool] Spawned {num_threads} worker threads");

        Self {
            inner: Arc::new(PoolInner {
                sender,
                num_threads,
            }),
        }
    }

    /// Returns the process-wide pool, spawning its threads on first use.
    ///
    /// It has one worker thread per available CPU, and is never shut down.
    pub fn global() -> &'static WorkerPool {
        GLOBAL_POOL.get_or_init(|| {
            log_debug!("[pool] Initializing the global worker pool");
            WorkerPoolBuilder::default().build()
        })
    }

    /// Returns the number of worker threads that have been spawned in this
    /// pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.inner.num_threads
    }

    /// Creates a pending [`Future`] whose continuations run on this pool.
    pub fn future(&self) -> Future {
        Future::new_in(self)
    }

    /// Queues a callback to run on one of the worker threads, with the given
    /// context. Never blocks.
    pub(crate) fn submit(&self, job: Job, context: Option<Context>) {
        log_trace!("[pool] Submitting a work item (context: {context:?})");
        if let Err(e) = self.inner.sender.send(WorkItem { job, context }) {
            // Workers survive panicking items, so the receivers outlive this
            // handle's sender unless a worker thread was killed externally.
            log_error!("[pool] Failed to submit a work item, all the worker threads are gone: {e}");
            panic!("Failed to submit a work item, all the worker threads are gone");
        }
    }

    /// Returns whether both handles refer to the same pool.
    pub fn same_pool(&self, other: &WorkerPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.inner.num_threads)
            .field("queued", &self.inner.sender.len())
            .finish()
    }
}

#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                log_warn!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
        CpuPinningPolicy::Always => {
            let mut cpu_set = CpuSet::new();
            if let Err(e) = cpu_set.set(id) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                panic!("Failed to set CPU affinity for thread #{id}: {e}");
            } else {
                log_debug!("Pinned thread #{id} to CPU #{id}");
            }
        }
    }
}

#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize, _cpu_pinning: CpuPinningPolicy) {}

/// Context object owned by a worker thread.
struct Worker {
    /// Thread index.
    id: usize,
    /// Consumer side of the work queue.
    receiver: Receiver<WorkItem>,
}

impl Worker {
    /// Main function run by this thread.
    ///
    /// A panicking work item is logged and dropped, and this worker moves on to
    /// the next item, so that the pool keeps its size.
    fn run(self) {
        log_debug!("[worker {}] Started", self.id);

        while let Ok(item) = self.receiver.recv() {
            log_trace!("[worker {}] Executing a work item", self.id);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| item.execute())) {
                let message = panic_message(payload.as_ref());
                log_error!("[worker {}] A work item panicked: {message}", self.id);
            }
        }

        log_debug!("[worker {}] Work queue disconnected, exiting", self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn pool_with(num_threads: usize) -> WorkerPool {
        WorkerPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_thread_count_resolves() {
        assert_eq!(
            ThreadCount::AvailableParallelism.count(),
            std::thread::available_parallelism().unwrap()
        );
        assert_eq!(
            ThreadCount::try_from(3).unwrap().count(),
            NonZeroUsize::try_from(3).unwrap()
        );
    }

    #[test]
    fn test_num_threads() {
        let pool = WorkerPoolBuilder::default().build();
        assert_eq!(
            pool.num_threads(),
            std::thread::available_parallelism().unwrap()
        );

        let pool = pool_with(4);
        assert_eq!(pool.num_threads(), NonZeroUsize::try_from(4).unwrap());
    }

    #[test]
    fn test_global_pool_is_shared() {
        let a = WorkerPool::global();
        let b = WorkerPool::global();
        assert!(a.same_pool(b));
        assert!(!a.same_pool(&pool_with(1)));
        assert_eq!(
            a.num_threads(),
            std::thread::available_parallelism().unwrap()
        );
    }

    #[test]
    fn test_submit_runs_every_item() {
        let pool = pool_with(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..1000 {
            let counter = counter.clone();
            let tx = tx.clone();
            pool.submit(
                Box::new(move |_: &Context| {
                    if counter.fetch_add(1, Ordering::SeqCst) == 999 {
                        tx.send(()).unwrap();
                    }
                }),
                None,
            );
        }

        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_submit_applies_context_per_item() {
        // A single worker processes the items one after the other, so a context
        // leaking from one item would be visible to the next.
        let pool = pool_with(1);
        let (tx, rx) = mpsc::channel();

        for i in 0..10u32 {
            let tx = tx.clone();
            let context = (i % 2 == 0).then(|| Context::empty().with("i", i));
            pool.submit(
                Box::new(move |context: &Context| tx.send((i, context.get::<u32>("i").copied())).unwrap()),
                context,
            );
        }
        drop(tx);

        let seen = rx.iter().collect::<Vec<_>>();
        assert_eq!(
            seen,
            (0..10u32)
                .map(|i| (i, (i % 2 == 0).then_some(i)))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_submit_doesnt_block() {
        let pool = pool_with(1);
        let (tx, rx) = mpsc::channel::<()>();

        // The only worker is busy until `tx` is dropped, so every following item
        // stays in the queue.
        pool.submit(
            Box::new(move |_: &Context| {
                let _ = rx.recv();
            }),
            None,
        );
        for _ in 0..10_000 {
            pool.submit(Box::new(|_: &Context| ()), None);
        }
        drop(tx);
    }

    #[test]
    fn test_worker_survives_panicking_item() {
        fn panicking(_: &Context) {
            panic!("work item panic");
        }

        let pool = pool_with(1);
        pool.submit(Box::new(panicking), None);

        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move |_: &Context| tx.send(()).unwrap()), None);
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }

    #[test]
    fn test_worker_survives_contract_violation() {
        let pool = pool_with(1);
        let source = pool.future();
        let next = source.continue_with(|| ());
        // The continuation's own completion then violates the contract on the
        // worker thread.
        next.complete();
        source.complete();

        for _ in 0..10 {
            pool.run(|| ()).wait().unwrap();
        }
        assert_eq!(next.state(), crate::FutureState::Succeeded);
    }

    #[test]
    fn test_build_cpu_pinning_if_supported() {
        let pool = WorkerPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();

        let futures = (0..10).map(|_| pool.run(|| ())).collect::<Vec<_>>();
        pool.when_all(futures).wait().unwrap();
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_build_cpu_pinning_always_not_supported() {
        WorkerPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();
    }

    #[test]
    fn test_debug() {
        let pool = pool_with(2);
        assert_eq!(
            format!("{pool:?}"),
            "WorkerPool { num_threads: 2, queued: 0 }"
        );
    }
}
