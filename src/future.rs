// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Single-assignment futures with a single continuation.

use crate::context::Context;
use crate::error::{capture, BoxError, ContractViolation, TaskError};
use crate::macros::{log_debug, log_error, log_trace};
use crate::pool::sync::Event;
use crate::pool::{Job, WorkerPool};
use std::fmt;
use std::future::IntoFuture;
use std::panic::Location;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{self, Poll, Waker};

/// A value that a callback can return to signal success or failure.
///
/// Callbacks passed to [`Future::continue_with()`] or [`run()`](crate::run)
/// can return either `()`, or a `Result<(), E>` for any error type that
/// converts into a [`BoxError`].
pub trait Outcome {
    /// Converts this value into a result.
    fn into_outcome(self) -> Result<(), BoxError>;
}

impl Outcome for () {
    fn into_outcome(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E: Into<BoxError>> Outcome for Result<(), E> {
    fn into_outcome(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

/// A value that a callback passed to [`Future::then()`] can return: the next
/// [`Future`] in the chain, or an error preventing to produce it.
pub trait Chained {
    /// Converts this value into the next future, or an error.
    fn into_chained(self) -> Result<Future, BoxError>;
}

impl Chained for Future {
    fn into_chained(self) -> Result<Future, BoxError> {
        Ok(self)
    }
}

impl<E: Into<BoxError>> Chained for Result<Future, E> {
    fn into_chained(self) -> Result<Future, BoxError> {
        self.map_err(Into::into)
    }
}

/// Observable state of a [`Future`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutureState {
    /// Not completed yet.
    Pending,
    /// Completed successfully.
    Succeeded,
    /// Completed with an error.
    Failed,
}

/// A single-assignment completion signal.
///
/// A [`Future`] starts pending, and transitions exactly once to a terminal
/// state, either via [`complete()`](Self::complete) or via
/// [`fail()`](Self::fail). Completing a future twice is a contract violation,
/// which panics.
///
/// Observers can either block on [`wait()`](Self::wait), `.await` it, or
/// register a single continuation with [`continue_with()`](Self::continue_with)
/// or [`then()`](Self::then), which runs on the future's [`WorkerPool`] once
/// the future completes. The continuation slot is also what
/// [`wait()`](Self::wait) and `.await` use to get notified, so a pending future
/// supports exactly one kind of observation. Any number of threads may
/// [`wait()`](Self::wait) on it concurrently though.
///
/// Handles are cheap to clone, and all clones refer to the same future.
#[derive(Clone)]
pub struct Future {
    shared: Arc<Shared>,
}

struct Shared {
    cell: Mutex<Cell>,
    pool: WorkerPool,
}

struct Cell {
    state: State,
    continuation: Option<Continuation>,
    /// Event signaled by the continuation, when that continuation was
    /// registered by [`Future::wait()`].
    waiters: Option<Arc<Event>>,
}

enum State {
    Pending,
    Succeeded,
    Failed(TaskError),
}

/// A callback registered on a pending future, with the context captured at
/// registration.
pub(crate) struct Continuation {
    job: Job,
    context: Option<Context>,
}

impl Continuation {
    pub(crate) fn new(job: impl FnOnce(&Context) + Send + 'static) -> Self {
        Self {
            job: Box::new(job),
            context: None,
        }
    }

    pub(crate) fn with_context(
        context: Context,
        job: impl FnOnce(&Context) + Send + 'static,
    ) -> Self {
        Self {
            job: Box::new(job),
            context: Some(context),
        }
    }

    /// Queues this continuation on the given pool, with its captured context.
    pub(crate) fn schedule_on(self, pool: &WorkerPool) {
        pool.submit(self.job, self.context);
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

impl Future {
    /// Creates a pending future running its continuation on the
    /// [global](WorkerPool::global) pool.
    pub fn new() -> Self {
        Self::new_in(WorkerPool::global())
    }

    /// Creates a pending future running its continuation on the given pool.
    pub fn new_in(pool: &WorkerPool) -> Self {
        Self {
            shared: Arc::new(Shared {
                cell: Mutex::new(Cell {
                    state: State::Pending,
                    continuation: None,
                    waiters: None,
                }),
                pool: pool.clone(),
            }),
        }
    }

    /// Returns the pool that this future's continuation runs on.
    pub fn pool(&self) -> &WorkerPool {
        &self.shared.pool
    }

    fn lock(&self) -> MutexGuard<'_, Cell> {
        self.shared.cell.lock().unwrap()
    }

    /// Returns whether this future has completed, successfully or not.
    pub fn is_completed(&self) -> bool {
        !matches!(self.lock().state, State::Pending)
    }

    /// Returns the current state of this future.
    pub fn state(&self) -> FutureState {
        match self.lock().state {
            State::Pending => FutureState::Pending,
            State::Succeeded => FutureState::Succeeded,
            State::Failed(_) => FutureState::Failed,
        }
    }

    /// Returns the error of this future if it has failed, without blocking.
    pub fn error(&self) -> Option<TaskError> {
        match &self.lock().state {
            State::Failed(error) => Some(error.clone()),
            State::Pending | State::Succeeded => None,
        }
    }

    /// Returns the outcome of this future, or [`None`] if it's still pending.
    pub(crate) fn outcome(&self) -> Option<Result<(), TaskError>> {
        match &self.lock().state {
            State::Pending => None,
            State::Succeeded => Some(Ok(())),
            State::Failed(error) => Some(Err(error.clone())),
        }
    }

    /// Completes this future successfully, scheduling its continuation if
    /// any.
    ///
    /// Panics if this future was already completed.
    #[track_caller]
    pub fn complete(&self) {
        self.settle_or_panic(Ok(()));
    }

    /// Completes this future with the given error, scheduling its continuation
    /// if any.
    ///
    /// Panics if this future was already completed.
    #[track_caller]
    pub fn fail(&self, error: impl Into<BoxError>) {
        let error = TaskError::from_boxed(error.into(), Location::caller());
        self.settle_or_panic(Err(error));
    }

    /// Completes this future successfully, or returns an error if it was
    /// already completed.
    pub fn try_complete(&self) -> Result<(), ContractViolation> {
        self.settle(Ok(()))
    }

    /// Completes this future with the given error, or returns an error if it
    /// was already completed.
    #[track_caller]
    pub fn try_fail(&self, error: impl Into<BoxError>) -> Result<(), ContractViolation> {
        let error = TaskError::from_boxed(error.into(), Location::caller());
        self.settle(Err(error))
    }

    #[track_caller]
    pub(crate) fn settle_or_panic(&self, outcome: Result<(), TaskError>) {
        if let Err(violation) = self.settle(outcome) {
            log_error!(
                "Cannot complete a future at {}: {violation}",
                Location::caller()
            );
            panic!("Cannot complete this future: {violation}");
        }
    }

    /// Transitions this future to a terminal state. This is the only place
    /// where the state leaves [`State::Pending`].
    pub(crate) fn settle(&self, outcome: Result<(), TaskError>) -> Result<(), ContractViolation> {
        let continuation = {
            let mut cell = self.lock();
            if !matches!(cell.state, State::Pending) {
                return Err(ContractViolation::AlreadyCompleted);
            }
            cell.state = match outcome {
                Ok(()) => State::Succeeded,
                Err(error) => State::Failed(error),
            };
            cell.waiters = None;
            cell.continuation.take()
        };

        if let Some(continuation) = continuation {
            log_trace!("Future completed, scheduling its continuation");
            continuation.schedule_on(&self.shared.pool);
        }
        Ok(())
    }

    /// Registers the continuation of this future.
    ///
    /// If this future is already completed, the continuation is handed back
    /// instead, and the caller is responsible for it. The terminal check and
    /// the registration happen under the same lock, so that exactly one of
    /// the completer and the registrant schedules the continuation.
    pub(crate) fn try_register(
        &self,
        continuation: Continuation,
    ) -> Result<Option<Continuation>, ContractViolation> {
        let mut cell = self.lock();
        if !matches!(cell.state, State::Pending) {
            return Ok(Some(continuation));
        }
        if cell.continuation.is_some() {
            return Err(ContractViolation::ContinuationAlreadyRegistered);
        }
        cell.continuation = Some(continuation);
        Ok(None)
    }

    /// Registers the continuation of this future, scheduling it right away if
    /// this future is already completed.
    ///
    /// Panics if a continuation was already registered.
    #[track_caller]
    pub(crate) fn register(&self, continuation: Continuation) {
        match self.try_register(continuation) {
            Ok(None) => log_trace!("Registered a continuation on a pending future"),
            Ok(Some(continuation)) => {
                log_trace!("Future already completed, scheduling the continuation");
                continuation.schedule_on(&self.shared.pool);
            }
            Err(violation) => {
                log_error!(
                    "Cannot register a continuation at {}: {violation}",
                    Location::caller()
                );
                panic!("Cannot register a continuation: {violation}");
            }
        }
    }

    /// Blocks the calling thread until this future completes, and returns its
    /// outcome.
    ///
    /// If this future failed, the original [`TaskError`] is returned, with the
    /// caller's location appended to its propagation trace.
    ///
    /// If this future is still pending, the first waiter registers a
    /// continuation that wakes up every waiting thread, and later waiters
    /// share it. This is therefore a contract violation (and panics) if a
    /// continuation other than a waiter's is already registered, including
    /// one registered by `.await`. Calling this from a worker thread of the
    /// future's pool can deadlock if all the other workers are blocked too.
    #[track_caller]
    pub fn wait(&self) -> Result<(), TaskError> {
        let location = Location::caller();

        match self.wait_event() {
            Ok(Some(event)) => {
                log_debug!("Blocking at {location} until the future completes");
                event.wait();
            }
            Ok(None) => (),
            Err(violation) => {
                log_error!("Cannot wait on a future at {location}: {violation}");
                panic!("Cannot wait on this future: {violation}");
            }
        }

        match self.outcome() {
            Some(Ok(())) => Ok(()),
            Some(Err(error)) => Err(error.propagated(location)),
            None => unreachable!("Woke up before the future completed"),
        }
    }

    /// Returns the event to block on until this future completes, registering
    /// it as the continuation for the first waiter. Returns [`None`] if this
    /// future is already completed.
    fn wait_event(&self) -> Result<Option<Arc<Event>>, ContractViolation> {
        let mut cell = self.lock();
        if !matches!(cell.state, State::Pending) {
            return Ok(None);
        }
        if let Some(event) = &cell.waiters {
            return Ok(Some(event.clone()));
        }
        if cell.continuation.is_some() {
            return Err(ContractViolation::ContinuationAlreadyRegistered);
        }

        let event = Arc::new(Event::new());
        let signal = event.clone();
        cell.continuation = Some(Continuation::new(move |_: &Context| signal.set()));
        cell.waiters = Some(event.clone());
        Ok(Some(event))
    }

    /// Registers `callback` to run once this future completes, and returns a
    /// future that completes once `callback` has run.
    ///
    /// The returned future fails if `callback` returns an error or panics. The
    /// callback runs regardless of whether this future succeeded or failed.
    ///
    /// ```
    /// # use taskchain::Future;
    /// let future = Future::new();
    /// let next = future.continue_with(|| println!("first future done"));
    /// future.complete();
    /// next.wait().unwrap();
    /// ```
    #[track_caller]
    pub fn continue_with<O: Outcome>(
        &self,
        callback: impl FnOnce() -> O + Send + 'static,
    ) -> Future {
        let location = Location::caller();
        let (next, job) = action_job(&self.shared.pool, location, move |_| callback());
        self.register(Continuation::new(job));
        next
    }

    /// Same as [`continue_with()`](Self::continue_with), but `callback`
    /// receives the given context when it runs.
    #[track_caller]
    pub fn continue_with_context<O: Outcome>(
        &self,
        context: Context,
        callback: impl FnOnce(&Context) -> O + Send + 'static,
    ) -> Future {
        let location = Location::caller();
        let (next, job) = action_job(&self.shared.pool, location, callback);
        self.register(Continuation::with_context(context, job));
        next
    }

    /// Registers `callback` to run once this future completes, and returns a
    /// future that mirrors the future returned by `callback`.
    ///
    /// This allows to chain asynchronous steps: each step runs as a separate
    /// work item on the pool, so long chains don't grow the stack.
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use taskchain::delay;
    /// delay(Duration::from_millis(10))
    ///     .then(|| delay(Duration::from_millis(10)))
    ///     .wait()
    ///     .unwrap();
    /// ```
    #[track_caller]
    pub fn then<C: Chained>(&self, callback: impl FnOnce() -> C + Send + 'static) -> Future {
        let location = Location::caller();
        let (next, job) = chained_job(&self.shared.pool, location, move |_| callback());
        self.register(Continuation::new(job));
        next
    }

    /// Same as [`then()`](Self::then), but `callback` receives the given
    /// context when it runs.
    #[track_caller]
    pub fn then_with_context<C: Chained>(
        &self,
        context: Context,
        callback: impl FnOnce(&Context) -> C + Send + 'static,
    ) -> Future {
        let location = Location::caller();
        let (next, job) = chained_job(&self.shared.pool, location, callback);
        self.register(Continuation::with_context(context, job));
        next
    }

    /// Registers a continuation that copies the outcome of this future onto
    /// `target`.
    fn forward_to(&self, target: Future, location: &'static Location<'static>) {
        let source = self.clone();
        let fallback = target.clone();
        let forward = Continuation::new(move |_: &Context| {
            let outcome = source
                .outcome()
                .expect("Continuation ran before its future completed");
            target.settle_or_panic(outcome);
        });
        match self.try_register(forward) {
            Ok(None) => (),
            Ok(Some(forward)) => forward.schedule_on(&self.shared.pool),
            Err(violation) => {
                // The inner future is already observed by someone else: fail the
                // chain rather than the worker thread.
                log_error!("Cannot chain onto the future returned at {location}: {violation}");
                fallback.settle_or_panic(Err(TaskError::from_kind(violation.into(), location)));
            }
        }
    }
}

/// Wraps an action callback into a job that settles the returned future with
/// the callback's outcome.
pub(crate) fn action_job<O: Outcome>(
    pool: &WorkerPool,
    location: &'static Location<'static>,
    callback: impl FnOnce(&Context) -> O + Send + 'static,
) -> (Future, impl FnOnce(&Context) + Send + 'static) {
    let next = Future::new_in(pool);
    let target = next.clone();
    let job = move |context: &Context| {
        let outcome = capture(location, || callback(context).into_outcome());
        target.settle_or_panic(outcome);
    };
    (next, job)
}

/// Wraps a chaining callback into a job that forwards the outcome of the
/// future produced by the callback onto the returned future.
fn chained_job<C: Chained>(
    pool: &WorkerPool,
    location: &'static Location<'static>,
    callback: impl FnOnce(&Context) -> C + Send + 'static,
) -> (Future, impl FnOnce(&Context) + Send + 'static) {
    let next = Future::new_in(pool);
    let target = next.clone();
    let job = move |context: &Context| {
        match capture(location, || callback(context).into_chained()) {
            Ok(inner) => inner.forward_to(target, location),
            Err(error) => target.settle_or_panic(Err(error)),
        }
    };
    (next, job)
}

/// Awaitable form of a [`Future`], obtained by `.await`-ing it (via
/// [`IntoFuture`]).
///
/// The first poll of a pending future registers a continuation that wakes the
/// awaiting task, so awaiting is subject to the same single-observation rule
/// as [`Future::continue_with()`]. Later polls only refresh the waker.
///
/// ```
/// # use taskchain::{run, TaskError};
/// async fn two_steps() -> Result<(), TaskError> {
///     run(|| println!("first")).await?;
///     run(|| println!("second")).await
/// }
/// # let _ = two_steps();
/// ```
pub struct Awaiter {
    future: Future,
    /// Waker of the latest poll, shared with the registered continuation.
    waker: Option<Arc<Mutex<Waker>>>,
    location: &'static Location<'static>,
}

impl IntoFuture for Future {
    type Output = Result<(), TaskError>;
    type IntoFuture = Awaiter;

    #[track_caller]
    fn into_future(self) -> Awaiter {
        Awaiter {
            future: self,
            waker: None,
            location: Location::caller(),
        }
    }
}

impl Awaiter {
    fn ready(&self) -> Option<Result<(), TaskError>> {
        self.future
            .outcome()
            .map(|outcome| outcome.map_err(|error| error.propagated(self.location)))
    }
}

impl std::future::Future for Awaiter {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.ready() {
            return Poll::Ready(outcome);
        }

        match &this.waker {
            Some(waker) => {
                let mut waker = waker.lock().unwrap();
                if !waker.will_wake(cx.waker()) {
                    *waker = cx.waker().clone();
                }
            }
            None => {
                let waker = Arc::new(Mutex::new(cx.waker().clone()));
                let wake = waker.clone();
                let continuation =
                    Continuation::new(move |_: &Context| wake.lock().unwrap().wake_by_ref());
                match this.future.try_register(continuation) {
                    Ok(None) => this.waker = Some(waker),
                    // Completed in the meantime, picked up below.
                    Ok(Some(_)) => (),
                    Err(violation) => {
                        log_error!(
                            "Cannot await a future at {}: {violation}",
                            this.location
                        );
                        panic!("Cannot await this future: {violation}");
                    }
                }
            }
        }

        // The continuation may have woken the previous waker before the
        // refresh above.
        match this.ready() {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("state", &self.state())
            .finish()
    }
}
