// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One-shot timers, fired by a single lazily-spawned background thread.
//!
//! The timer thread keeps the pending timers in a min-heap ordered by
//! deadline, and sleeps on a condition variable until the earliest one is due
//! (or until a new timer is scheduled). Due callbacks run on the timer thread
//! itself, outside of the lock, so they must be short.

use super::util::Status;
use crate::macros::{log_debug, log_error};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

static TIMER: OnceLock<Timer> = OnceLock::new();

/// Runs `callback` on the timer thread once `delay` has elapsed.
///
/// A delay too large to be represented as an [`Instant`] never elapses: the
/// callback is dropped without running.
pub fn schedule(delay: Duration, callback: impl FnOnce() + Send + 'static) {
    let Some(deadline) = Instant::now().checked_add(delay) else {
        log_debug!("[timer] Dropping a timer whose delay never elapses: {delay:?}");
        return;
    };
    TIMER
        .get_or_init(Timer::spawn)
        .schedule(deadline, Box::new(callback));
}

struct Timer {
    queue: Arc<Status<TimerQueue>>,
}

#[derive(Default)]
struct TimerQueue {
    entries: BinaryHeap<Reverse<Entry>>,
    /// Tie-breaker so that timers with equal deadlines fire in scheduling
    /// order.
    next_sequence: u64,
}

struct Entry {
    deadline: Instant,
    sequence: u64,
    callback: Callback,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.sequence).cmp(&(other.deadline, other.sequence))
    }
}

impl Timer {
    fn spawn() -> Self {
        let queue = Arc::new(Status::new(TimerQueue::default()));
        std::thread::Builder::new()
            .name("taskchain-timer".to_owned())
            .spawn({
                let queue = queue.clone();
                move || run(&queue)
            })
            .expect("Failed to spawn the timer thread");
        log_debug!("[timer] Spawned the timer thread");
        Self { queue }
    }

    fn schedule(&self, deadline: Instant, callback: Callback) {
        self.queue.update_and_notify_one(|queue| {
            let sequence = queue.next_sequence;
            queue.next_sequence += 1;
            queue.entries.push(Reverse(Entry {
                deadline,
                sequence,
                callback,
            }));
        });
    }
}

/// Main function run by the timer thread.
fn run(queue: &Status<TimerQueue>) {
    let mut guard = queue.lock();
    loop {
        let now = Instant::now();
        let next_deadline = guard.entries.peek().map(|Reverse(entry)| entry.deadline);
        match next_deadline {
            None => guard = queue.wait(guard),
            Some(deadline) if deadline > now => guard = queue.wait_timeout(guard, deadline - now),
            Some(_) => {
                let Some(Reverse(entry)) = guard.entries.pop() else {
                    continue;
                };
                drop(guard);
                if catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
                    log_error!("[timer] A timer callback panicked");
                }
                guard = queue.lock();
            }
        }
    }
}
