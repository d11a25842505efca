// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Immutable context values carried across asynchronous hand-offs.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

type Values = BTreeMap<&'static str, Arc<dyn Any + Send + Sync>>;

/// An immutable snapshot of ambient values, attached to a continuation when it
/// is registered and handed to it when it runs on a worker thread.
///
/// A [`Context`] is never mutated once created: [`with()`](Self::with) returns
/// a new context and leaves the original untouched. Cloning is cheap, as the
/// values are shared.
///
/// ```
/// # use taskchain::Context;
/// let parent = Context::empty().with("request_id", 42u32);
/// let child = parent.with("user", "alice");
///
/// assert_eq!(parent.get::<u32>("request_id"), Some(&42));
/// assert_eq!(parent.get::<&str>("user"), None);
/// assert_eq!(child.get::<&str>("user"), Some(&"alice"));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    values: Option<Arc<Values>>,
}

impl Context {
    /// Returns a context without any value. This doesn't allocate.
    pub fn empty() -> Self {
        Self { values: None }
    }

    /// Returns a new context containing all the values of this one, with the
    /// given key bound to the given value (replacing any previous binding of
    /// that key).
    pub fn with<T: Any + Send + Sync>(&self, key: &'static str, value: T) -> Self {
        let mut values = match &self.values {
            Some(values) => Values::clone(values),
            None => Values::new(),
        };
        values.insert(key, Arc::new(value));
        Self {
            values: Some(Arc::new(values)),
        }
    }

    /// Returns the value bound to the given key, if any and if it has type
    /// `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.as_ref()?.get(key)?.downcast_ref::<T>()
    }

    /// Returns whether a value is bound to the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values
            .as_ref()
            .is_some_and(|values| values.contains_key(key))
    }

    /// Returns the number of bound keys.
    pub fn len(&self) -> usize {
        self.values.as_ref().map_or(0, |values| values.len())
    }

    /// Returns whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the bound keys, in lexicographic order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.iter().flat_map(|values| values.keys().copied())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}
