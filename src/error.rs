// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors stored in failed futures and propagated to their observers.

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::Arc;
use thiserror::Error;

/// A type-erased error, as returned by user callbacks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Misuse of the single-assignment contract of a [`Future`](crate::Future).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// The future was already completed (successfully or not).
    #[error("the future was already completed")]
    AlreadyCompleted,
    /// A continuation was already registered on the future.
    #[error("a continuation is already registered on the future")]
    ContinuationAlreadyRegistered,
}

/// The payload of a failed future.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// A producer returned an error.
    #[error("{0}")]
    Failed(#[source] BoxError),
    /// A producer panicked, with the given panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// Some members of a [`when_all()`](crate::when_all) group failed.
    #[error("{} of {total} futures failed", .failures.len())]
    Aggregate {
        /// The errors of the failed members, in completion order.
        failures: Vec<TaskError>,
        /// Total number of members in the group.
        total: usize,
    },
    /// A continuation couldn't be chained onto a future.
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// The error of a failed [`Future`](crate::Future).
///
/// A [`TaskError`] is a shared handle to the original failure: cloning it, or
/// propagating it through [`Future::wait()`](crate::Future::wait), keeps the
/// same underlying error and origin. Each propagation appends the location it
/// went through to a trace, rather than overwriting where the error came from.
///
/// ```
/// # use taskchain::Future;
/// let future = Future::new();
/// future.fail("disk on fire");
///
/// let first = future.wait().unwrap_err();
/// let second = future.wait().unwrap_err();
/// assert!(first.same_origin(&second));
/// assert_eq!(first.to_string(), "disk on fire");
/// assert_eq!(first.propagation().len(), 1);
/// ```
#[derive(Clone)]
pub struct TaskError {
    inner: Arc<Inner>,
    propagation: Vec<&'static Location<'static>>,
}

struct Inner {
    kind: ErrorKind,
    origin: &'static Location<'static>,
}

impl TaskError {
    /// Creates an error from the given payload, with the caller's location as
    /// origin.
    #[track_caller]
    pub fn new(error: impl Into<BoxError>) -> Self {
        Self::from_boxed(error.into(), Location::caller())
    }

    pub(crate) fn from_kind(kind: ErrorKind, origin: &'static Location<'static>) -> Self {
        Self {
            inner: Arc::new(Inner { kind, origin }),
            propagation: Vec::new(),
        }
    }

    /// Wraps a boxed error. An error that already is a [`TaskError`] keeps its
    /// identity, and the given location is appended to its trace instead.
    pub(crate) fn from_boxed(error: BoxError, location: &'static Location<'static>) -> Self {
        match error.downcast::<TaskError>() {
            Ok(task_error) => task_error.propagated(location),
            Err(error) => Self::from_kind(ErrorKind::Failed(error), location),
        }
    }

    pub(crate) fn from_panic(
        payload: Box<dyn Any + Send>,
        location: &'static Location<'static>,
    ) -> Self {
        let message = panic_message(payload.as_ref()).to_owned();
        Self::from_kind(ErrorKind::Panicked(message), location)
    }

    /// Returns a copy of this error with the given location appended to the
    /// propagation trace.
    pub(crate) fn propagated(&self, location: &'static Location<'static>) -> Self {
        let mut propagation = self.propagation.clone();
        propagation.push(location);
        Self {
            inner: self.inner.clone(),
            propagation,
        }
    }

    /// Returns the payload of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    /// Returns the location where this error was first captured.
    pub fn origin(&self) -> &'static Location<'static> {
        self.inner.origin
    }

    /// Returns the locations this error was propagated through since its
    /// origin, oldest first.
    pub fn propagation(&self) -> &[&'static Location<'static>] {
        &self.propagation
    }

    /// Returns whether both errors stem from the same original failure.
    pub fn same_origin(&self, other: &TaskError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns whether this error was caused by a panic.
    pub fn is_panic(&self) -> bool {
        matches!(self.inner.kind, ErrorKind::Panicked(_))
    }

    /// Returns the original error if it has type `E`.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match &self.inner.kind {
            ErrorKind::Failed(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner.kind, f)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.inner.kind)?;
        write!(f, "   at {}", self.inner.origin)?;
        if !self.propagation.is_empty() {
            write!(f, "\n--- end of trace from previous location ---")?;
            for location in &self.propagation {
                write!(f, "\n   at {location}")?;
            }
        }
        Ok(())
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.kind.source()
    }
}

/// Extracts the message of a panic payload, as passed to `panic!()`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "Box<dyn Any>"
    }
}

/// Runs the given producer, converting both its error and any panic into a
/// [`TaskError`] originating at `location`.
pub(crate) fn capture<T>(
    location: &'static Location<'static>,
    f: impl FnOnce() -> Result<T, BoxError>,
) -> Result<T, TaskError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(t)) => Ok(t),
        Ok(Err(error)) => Err(TaskError::from_boxed(error, location)),
        Err(payload) => Err(TaskError::from_panic(payload, location)),
    }
}
