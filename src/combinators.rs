// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Functions creating and composing futures, built on the public contract of
//! [`Future`].

use crate::context::Context;
use crate::error::{capture, BoxError, ErrorKind, TaskError};
use crate::future::{action_job, Continuation, Future, Outcome};
use crate::macros::{log_debug, log_trace};
use crate::pool::sync::Countdown;
use crate::pool::{timer, WorkerPool};
use std::panic::Location;
use std::sync::{Arc, Mutex};
use std::time::Duration;

impl WorkerPool {
    /// Runs `action` on this pool, and returns a future that completes once it
    /// has run.
    ///
    /// The returned future fails if `action` returns an error or panics.
    #[track_caller]
    pub fn run<O: Outcome>(&self, action: impl FnOnce() -> O + Send + 'static) -> Future {
        let (future, job) = action_job(self, Location::caller(), move |_| action());
        self.submit(Box::new(job), None);
        future
    }

    /// Same as [`run()`](Self::run), but `action` receives the given context
    /// when it runs.
    #[track_caller]
    pub fn run_with_context<O: Outcome>(
        &self,
        context: Context,
        action: impl FnOnce(&Context) -> O + Send + 'static,
    ) -> Future {
        let (future, job) = action_job(self, Location::caller(), action);
        self.submit(Box::new(job), Some(context));
        future
    }

    /// Returns a future that completes once all the given futures have
    /// completed.
    ///
    /// If some of them failed, the returned future fails with an
    /// [`ErrorKind::Aggregate`] listing their errors. This registers the
    /// continuation of every given future.
    #[track_caller]
    pub fn when_all(&self, futures: impl IntoIterator<Item = Future>) -> Future {
        let location = Location::caller();
        let futures = futures.into_iter().collect::<Vec<_>>();
        let all = self.future();

        if futures.is_empty() {
            all.complete();
            return all;
        }

        let group = Arc::new(Group {
            remaining: Countdown::new(futures.len()),
            failures: Mutex::new(Vec::new()),
            total: futures.len(),
        });
        for future in futures {
            let group = group.clone();
            let all = all.clone();
            let member = future.clone();
            future.register(Continuation::new(move |_: &Context| {
                if let Some(Err(error)) = member.outcome() {
                    group.failures.lock().unwrap().push(error);
                }
                if group.remaining.decrement() {
                    log_trace!("Last member of a group of {} completed", group.total);
                    all.settle_or_panic(group.outcome(location));
                }
            }));
        }
        all
    }

    /// Returns a future that completes once the given duration has elapsed.
    ///
    /// A duration too large to be represented as a deadline never elapses,
    /// and the returned future stays pending.
    pub fn delay(&self, duration: Duration) -> Future {
        let future = self.future();
        let target = future.clone();
        timer::schedule(duration, move || target.complete());
        future
    }

    /// Drives the futures produced by the given sequence one at a time, and
    /// returns a future that completes once the sequence is exhausted.
    ///
    /// The next future is only pulled from the sequence once the previous one
    /// has completed, and each step is scheduled as a separate work item, so
    /// that arbitrarily long sequences neither block a thread nor grow the
    /// stack. The returned future fails, and the sequence isn't advanced
    /// further, if producing the next future fails (returns an error or
    /// panics) or if a produced future fails.
    ///
    /// ```
    /// # use std::sync::{Arc, Mutex};
    /// # use taskchain::{iterate, run};
    /// let steps = Arc::new(Mutex::new(Vec::new()));
    /// let sequence = (0..3).map({
    ///     let steps = steps.clone();
    ///     move |i| {
    ///         let steps = steps.clone();
    ///         Ok::<_, std::convert::Infallible>(run(move || steps.lock().unwrap().push(i)))
    ///     }
    /// });
    /// iterate(sequence).wait().unwrap();
    /// assert_eq!(*steps.lock().unwrap(), [0, 1, 2]);
    /// ```
    #[track_caller]
    pub fn iterate<I, E>(&self, sequence: I) -> Future
    where
        I: IntoIterator<Item = Result<Future, E>>,
        I::IntoIter: Send + 'static,
        E: Into<BoxError>,
    {
        let done = self.future();
        Iteration {
            steps: sequence.into_iter(),
            done: done.clone(),
            location: Location::caller(),
        }
        .advance();
        done
    }
}

/// Shared state of a [`WorkerPool::when_all()`] group.
struct Group {
    /// Number of members that haven't completed yet.
    remaining: Countdown,
    /// Errors of the members that failed so far.
    failures: Mutex<Vec<TaskError>>,
    /// Total number of members.
    total: usize,
}

impl Group {
    fn outcome(&self, location: &'static Location<'static>) -> Result<(), TaskError> {
        let failures = std::mem::take(&mut *self.failures.lock().unwrap());
        if failures.is_empty() {
            Ok(())
        } else {
            let kind = ErrorKind::Aggregate {
                failures,
                total: self.total,
            };
            Err(TaskError::from_kind(kind, location))
        }
    }
}

/// State of a [`WorkerPool::iterate()`] loop, moved from one step to the next.
struct Iteration<I> {
    steps: I,
    done: Future,
    location: &'static Location<'static>,
}

impl<I, E> Iteration<I>
where
    I: Iterator<Item = Result<Future, E>> + Send + 'static,
    E: Into<BoxError>,
{
    /// Pulls the next future from the sequence, and registers the following
    /// step as its continuation.
    fn advance(mut self) {
        let steps = &mut self.steps;
        let next = capture(self.location, || steps.next().transpose().map_err(Into::into));
        match next {
            Ok(Some(current)) => {
                let done = self.done.clone();
                let location = self.location;
                let watched = current.clone();
                let step = Continuation::new(move |_: &Context| match watched.outcome() {
                    Some(Ok(())) => self.advance(),
                    Some(Err(error)) => self.done.settle_or_panic(Err(error)),
                    None => unreachable!("Continuation ran before its future completed"),
                });
                match current.try_register(step) {
                    Ok(None) => (),
                    // Schedule the next step rather than recursing into it.
                    Ok(Some(step)) => step.schedule_on(current.pool()),
                    Err(violation) => {
                        done.settle_or_panic(Err(TaskError::from_kind(violation.into(), location)))
                    }
                }
            }
            Ok(None) => {
                log_debug!("Sequence exhausted, completing the iteration");
                self.done.settle_or_panic(Ok(()));
            }
            Err(error) => self.done.settle_or_panic(Err(error)),
        }
    }
}

/// Runs `action` on the [global](WorkerPool::global) pool. See
/// [`WorkerPool::run()`].
///
/// ```
/// # use taskchain::run;
/// let future = run(|| println!("Hello from a worker thread"));
/// future.wait().unwrap();
/// ```
#[track_caller]
pub fn run<O: Outcome>(action: impl FnOnce() -> O + Send + 'static) -> Future {
    WorkerPool::global().run(action)
}

/// Runs `action` on the [global](WorkerPool::global) pool with the given
/// context. See [`WorkerPool::run_with_context()`].
#[track_caller]
pub fn run_with_context<O: Outcome>(
    context: Context,
    action: impl FnOnce(&Context) -> O + Send + 'static,
) -> Future {
    WorkerPool::global().run_with_context(context, action)
}

/// Returns a future that completes once all the given futures have completed.
/// See [`WorkerPool::when_all()`].
#[track_caller]
pub fn when_all(futures: impl IntoIterator<Item = Future>) -> Future {
    WorkerPool::global().when_all(futures)
}

/// Returns a future that completes once the given duration has elapsed. See
/// [`WorkerPool::delay()`].
pub fn delay(duration: Duration) -> Future {
    WorkerPool::global().delay(duration)
}

/// Drives the futures produced by the given sequence one at a time, on the
/// [global](WorkerPool::global) pool. See [`WorkerPool::iterate()`].
#[track_caller]
pub fn iterate<I, E>(sequence: I) -> Future
where
    I: IntoIterator<Item = Result<Future, E>>,
    I::IntoIter: Send + 'static,
    E: Into<BoxError>,
{
    WorkerPool::global().iterate(sequence)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CpuPinningPolicy, FutureState, ThreadCount, WorkerPoolBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::time::Instant;

    fn completed() -> Future {
        let future = Future::new();
        future.complete();
        future
    }

    fn pool_with(num_threads: usize) -> WorkerPool {
        WorkerPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    #[test]
    fn test_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let future = run({
            let counter = counter.clone();
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        future.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_doesnt_block() {
        let (tx, rx) = mpsc::channel::<()>();
        let start = Instant::now();
        let future = run(move || rx.recv_timeout(Duration::from_secs(10)));
        assert!(!future.is_completed());
        assert!(start.elapsed() < Duration::from_secs(5));
        tx.send(()).unwrap();
        future.wait().unwrap();
    }

    #[test]
    fn test_run_error() {
        let line = line!() + 1;
        let future = run(|| Err::<(), _>("producer failed"));
        let error = future.wait().unwrap_err();
        assert_eq!(error.to_string(), "producer failed");
        // The error points at the producer's call site.
        assert_eq!(error.origin().line(), line);
        assert_eq!(error.origin().file(), file!());
    }

    #[test]
    fn test_run_panic() {
        let future = run::<()>(|| panic!("arithmetic panic"));
        let error = future.wait().unwrap_err();
        assert!(error.is_panic());
    }

    #[test]
    fn test_run_with_context() {
        let futures = (0..100u32)
            .map(|i| {
                let context = Context::empty().with("value", i);
                run_with_context(context, move |context| {
                    if context.get::<u32>("value") == Some(&i) {
                        Ok(())
                    } else {
                        Err(format!("task {i} saw {:?}", context.get::<u32>("value")))
                    }
                })
            })
            .collect::<Vec<_>>();
        when_all(futures).wait().unwrap();
    }

    #[test]
    fn test_run_on_dedicated_pool() {
        let pool = pool_with(2);
        let future = pool.run(|| {
            let name = std::thread::current().name().map(str::to_owned);
            if name.as_deref().is_some_and(|n| n.starts_with("taskchain-worker-")) {
                Ok(())
            } else {
                Err(format!("ran on unexpected thread {name:?}"))
            }
        });
        assert!(future.pool().same_pool(&pool));
        future.wait().unwrap();

        let chained = future.continue_with(|| ());
        assert!(chained.pool().same_pool(&pool));
        chained.wait().unwrap();
    }

    #[test]
    fn test_when_all_empty() {
        let all = when_all(Vec::new());
        assert_eq!(all.state(), FutureState::Succeeded);
        all.wait().unwrap();
    }

    #[test]
    fn test_when_all_waits_for_every_member() {
        let members = (0..5).map(|_| Future::new()).collect::<Vec<_>>();
        let all = when_all(members.clone());

        for member in &members[..4] {
            member.complete();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(!all.is_completed());

        members[4].complete();
        all.wait().unwrap();
    }

    #[test]
    fn test_when_all_already_completed_members() {
        let all = when_all((0..10).map(|_| completed()));
        all.wait().unwrap();
    }

    #[test]
    fn test_when_all_completes_once_under_race() {
        const NUM_FUTURES: usize = 64;

        for _ in 0..10 {
            let members = (0..NUM_FUTURES).map(|_| Future::new()).collect::<Vec<_>>();
            let fired = Arc::new(AtomicUsize::new(0));
            let done = when_all(members.clone()).continue_with({
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            });

            let barrier = Arc::new(Barrier::new(NUM_FUTURES));
            let threads = members
                .into_iter()
                .map(|member| {
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        member.complete();
                    })
                })
                .collect::<Vec<_>>();
            for t in threads {
                t.join().unwrap();
            }

            done.wait().unwrap();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_when_all_aggregates_failures() {
        let members = (0..4).map(|_| Future::new()).collect::<Vec<_>>();
        let all = when_all(members.clone());

        members[0].complete();
        members[1].fail("first");
        members[2].complete();
        members[3].fail("second");

        let error = all.wait().unwrap_err();
        match error.kind() {
            ErrorKind::Aggregate { failures, total } => {
                assert_eq!(*total, 4);
                let mut messages = failures.iter().map(|e| e.to_string()).collect::<Vec<_>>();
                messages.sort();
                assert_eq!(messages, ["first", "second"]);
            }
            kind => panic!("unexpected error kind: {kind:?}"),
        }
        assert_eq!(error.to_string(), "2 of 4 futures failed");
    }

    #[test]
    fn test_delay() {
        let start = Instant::now();
        let future = delay(Duration::from_millis(100));
        assert!(!future.is_completed());
        future.wait().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_delay_zero() {
        delay(Duration::ZERO).wait().unwrap();
    }

    #[test]
    fn test_delay_huge_duration() {
        let future = delay(Duration::MAX);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(future.state(), FutureState::Pending);
    }

    #[test]
    fn test_delay_chain() {
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        delay(Duration::from_millis(30))
            .then({
                let tx = tx.clone();
                move || {
                    tx.send("World!").unwrap();
                    delay(Duration::from_millis(30)).then(move || {
                        tx.send("And Calvin!").unwrap();
                        delay(Duration::from_millis(30)).continue_with(|| ())
                    })
                }
            })
            .wait()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), ["World!", "And Calvin!"]);
    }

    #[test]
    fn test_iterate_in_order() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let sequence = (0..3).map({
            let steps = steps.clone();
            move |i| {
                let steps = steps.clone();
                Ok::<_, BoxError>(run(move || steps.lock().unwrap().push(i)))
            }
        });
        iterate(sequence).wait().unwrap();
        assert_eq!(*steps.lock().unwrap(), [0, 1, 2]);
    }

    #[test]
    fn test_iterate_pulls_lazily() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let gates = (0..3).map(|_| Future::new()).collect::<Vec<_>>();
        let sequence = gates.clone().into_iter().map({
            let pulled = pulled.clone();
            move |gate| {
                pulled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(gate)
            }
        });

        let done = iterate(sequence);
        assert_eq!(pulled.load(Ordering::SeqCst), 1);

        gates[0].complete();
        gates[1].complete();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        assert!(!done.is_completed());

        gates[2].complete();
        done.wait().unwrap();
    }

    #[test]
    fn test_iterate_empty() {
        iterate(std::iter::empty::<Result<Future, BoxError>>())
            .wait()
            .unwrap();
    }

    #[test]
    fn test_iterate_stops_at_sequence_error() {
        let produced = Arc::new(AtomicUsize::new(0));
        let sequence = (0..3).map({
            let produced = produced.clone();
            move |i| {
                produced.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    Err("cannot produce the second step")
                } else {
                    Ok(completed())
                }
            }
        });

        let error = iterate(sequence).wait().unwrap_err();
        assert_eq!(error.to_string(), "cannot produce the second step");
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_iterate_stops_at_sequence_panic() {
        let sequence = (0..3).map(|i| {
            if i == 1 {
                panic!("sequence panicked");
            }
            Ok::<_, BoxError>(completed())
        });
        let error = iterate(sequence).wait().unwrap_err();
        assert!(error.is_panic());
    }

    #[test]
    fn test_iterate_stops_at_member_failure() {
        let produced = Arc::new(AtomicUsize::new(0));
        let sequence = (0..3).map({
            let produced = produced.clone();
            move |i| {
                produced.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    Ok::<_, BoxError>(run(|| Err::<(), _>("second step failed")))
                } else {
                    Ok(completed())
                }
            }
        });

        let error = iterate(sequence).wait().unwrap_err();
        assert_eq!(error.to_string(), "second step failed");
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_iterate_long_sequence() {
        let count = Arc::new(AtomicUsize::new(0));
        let sequence = (0..100_000).map({
            let count = count.clone();
            move |_| {
                count.fetch_add(1, Ordering::Relaxed);
                Ok::<_, BoxError>(completed())
            }
        });
        iterate(sequence).wait().unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 100_000);
    }
}
