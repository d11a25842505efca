// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod combinators;
mod context;
mod error;
mod future;
mod macros;
mod pool;

pub use combinators::{delay, iterate, run, run_with_context, when_all};
pub use context::Context;
pub use error::{BoxError, ContractViolation, ErrorKind, TaskError};
pub use future::{Awaiter, Chained, Future, FutureState, Outcome};
pub use pool::{CpuPinningPolicy, ThreadCount, WorkerPool, WorkerPoolBuilder};
