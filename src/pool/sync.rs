// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use super::util::Status;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A manual-reset event: once set, it stays set and every current or future
/// waiter is released.
pub struct Event {
    status: Status<bool>,
}

impl Event {
    /// Creates a new event in the unset state.
    pub fn new() -> Self {
        Self {
            status: Status::new(false),
        }
    }

    /// Sets the event, waking up all the waiting threads.
    pub fn set(&self) {
        self.status.notify_all(true);
    }

    /// Blocks the calling thread until the event is set.
    pub fn wait(&self) {
        let guard = self.status.wait_while(|is_set| !*is_set);
        assert!(*guard);
    }
}

/// A countdown that can be decremented concurrently, for which exactly one
/// decrementer observes the transition to zero.
pub struct Countdown {
    remaining: CachePadded<AtomicUsize>,
}

impl Countdown {
    /// Creates a countdown starting at the given count.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: CachePadded::new(AtomicUsize::new(count)),
        }
    }

    /// Decrements the countdown, returning whether this call brought it to
    /// zero.
    ///
    /// Panics if the countdown was already at zero.
    pub fn decrement(&self) -> bool {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Countdown decremented past zero");
        previous == 1
    }
}
