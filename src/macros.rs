// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Internal logging macros, forwarding to the `log` crate when the `log`
//! feature is enabled.
//!
//! Without the feature, the arguments are still type-checked (and count as
//! used) but nothing is formatted.

#[cfg(feature = "log")]
mod enabled {
    macro_rules! log_debug {
        ( $($args:tt)* ) => {
            log::debug!(target: "taskchain", $($args)*)
        };
    }

    macro_rules! log_error {
        ( $($args:tt)* ) => {
            log::error!(target: "taskchain", $($args)*)
        };
    }

    macro_rules! log_trace {
        ( $($args:tt)* ) => {
            log::trace!(target: "taskchain", $($args)*)
        };
    }

    macro_rules! log_warn {
        ( $($args:tt)* ) => {
            log::warn!(target: "taskchain", $($args)*)
        };
    }

    pub(crate) use {log_debug, log_error, log_trace, log_warn};
}

#[cfg(not(feature = "log"))]
mod disabled {
    macro_rules! log_discard {
        ( $($args:tt)* ) => {{
            let _ = format_args!($($args)*);
        }};
    }

    macro_rules! log_debug {
        ( $($args:tt)* ) => {
            $crate::macros::log_discard!($($args)*)
        };
    }

    macro_rules! log_error {
        ( $($args:tt)* ) => {
            $crate::macros::log_discard!($($args)*)
        };
    }

    macro_rules! log_trace {
        ( $($args:tt)* ) => {
            $crate::macros::log_discard!($($args)*)
        };
    }

    macro_rules! log_warn {
        ( $($args:tt)* ) => {
            $crate::macros::log_discard!($($args)*)
        };
    }

    pub(crate) use {log_debug, log_discard, log_error, log_trace, log_warn};
}

#[cfg(feature = "log")]
pub(crate) use enabled::*;

#[cfg(not(feature = "log"))]
pub(crate) use disabled::*;
