// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives: the exclusive-access container that collects
//! results across concurrently running tasks, and a [`Mutex`]-[`Condvar`]
//! status wrapper used by the executor implementations.

use std::sync::{Condvar, Mutex, MutexGuard};

/// A value shared between concurrently running tasks, protected by a
/// mutual-exclusion boundary.
///
/// The only way to touch the wrapped value while tasks are running is
/// [`with_exclusive()`](Self::with_exclusive), a synchronous critical
/// section: no two mutations ever execute concurrently against the same
/// container. Mutations are observed in some serial order, but that order is
/// *not* guaranteed to match task-submission order — it is whichever order
/// the tasks acquire exclusive access in.
///
/// ```rust
/// # use parslice::SharedValue;
/// let value = SharedValue::new(0);
/// value.with_exclusive(|v| *v += 2);
/// value.with_exclusive(|v| *v *= 10);
/// assert_eq!(value.into_inner(), 20);
/// ```
pub struct SharedValue<V> {
    value: Mutex<V>,
}

impl<V> SharedValue<V> {
    /// Wraps the given value.
    pub fn new(value: V) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Applies the given mutation to the wrapped value under exclusive
    /// access, returning once the mutation has fully completed.
    ///
    /// The underlying lock makes no FIFO promise, but it doesn't starve any
    /// waiting task indefinitely under an executor's concurrency bound.
    pub fn with_exclusive<R>(&self, mutate: impl FnOnce(&mut V) -> R) -> R {
        let mut guard = self.value.lock().unwrap();
        mutate(&mut guard)
    }

    /// Consumes the container and returns the wrapped value.
    pub fn into_inner(self) -> V {
        self.value.into_inner().unwrap()
    }
}

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// Compared to a bare pair, every mutation goes through a method that also
/// notifies waiters, so a state change can never be silently lost.
pub(crate) struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Applies the given mutation to the status and notifies all waiting
    /// threads.
    pub fn notify_all_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
        result
    }

    /// Returns a guard on the current status, without waiting.
    pub fn lock(&self) -> MutexGuard<T> {
        self.mutex.lock().unwrap()
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify
    /// the status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}
