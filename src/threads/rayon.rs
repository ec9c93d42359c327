// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Adaptor over Rayon thread pools.

use crate::executor::{Executor, Task};
use crate::macros::{log_debug, log_error};
use crate::sync::Status;
use crossbeam_utils::CachePadded;
use rayon_core::{Scope, Yield};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Adaptor implementing the [`Executor`] contract on top of a scope from the
/// [Rayon](https://docs.rs/rayon) crate, composing the Rayon pool rather than
/// extending it.
///
/// Rayon owns the worker threads, so two parts of the contract are honored
/// only as far as Rayon allows:
///
/// - [`set_max_concurrency()`](Executor::set_max_concurrency) adjusts the
///   advisory bound read back by [`max_concurrency()`](Executor::max_concurrency)
///   (and therefore the submission throttle of the whole-collection
///   operations), but it cannot resize the pool itself.
/// - [`cancel_all()`](Executor::cancel_all) cannot unqueue tasks already
///   handed to Rayon; instead, tasks that haven't started when the
///   cancellation flag is raised return immediately without running. The flag
///   stays raised for the lifetime of the adaptor.
///
/// [`await_all_completed()`](Executor::await_all_completed) cooperatively
/// drains the pool while waiting when called from a worker thread (which
/// includes the `rayon_core::scope` closure itself), so the barrier makes
/// progress even on a single-threaded pool.
///
/// ```rust
/// # use parslice::{ParallelSlice, RayonExecutor};
/// # use std::convert::Infallible;
/// # use std::num::NonZeroUsize;
/// let input: Vec<u64> = (1..=100).collect();
/// let sum = rayon_core::scope(|scope| {
///     let executor = RayonExecutor::new(scope, NonZeroUsize::try_from(8).unwrap());
///     input.parallel_reduce(&executor, 0u64, |acc, x| Ok::<_, Infallible>(acc + x))
/// });
/// assert_eq!(sum, 5_050);
/// ```
pub struct RayonExecutor<'pool, 'scope> {
    /// The Rayon scope tasks are spawned onto.
    scope: &'pool Scope<'scope>,
    /// Advisory upper bound on simultaneously running tasks.
    max_concurrency: CachePadded<AtomicUsize>,
    /// Completion barrier state, shared with the spawned tasks.
    shared: Arc<RayonShared>,
}

/// State shared between the adaptor and its in-flight tasks.
struct RayonShared {
    /// Number of tasks submitted but not finished yet.
    pending: Status<usize>,
    /// Raised by [`Executor::cancel_all()`]; tasks check it before running.
    cancelled: AtomicBool,
}

impl<'pool, 'scope> RayonExecutor<'pool, 'scope> {
    /// Wraps the given Rayon scope.
    pub fn new(scope: &'pool Scope<'scope>, max_concurrency: NonZeroUsize) -> Self {
        Self {
            scope,
            max_concurrency: CachePadded::new(AtomicUsize::new(max_concurrency.get())),
            shared: Arc::new(RayonShared {
                pending: Status::new(0),
                cancelled: AtomicBool::new(false),
            }),
        }
    }
}

impl<'scope> Executor<'scope> for RayonExecutor<'_, 'scope> {
    fn max_concurrency(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_concurrency.load(Ordering::SeqCst))
            .expect("the concurrency bound is always non-zero")
    }

    fn set_max_concurrency(&self, max_concurrency: NonZeroUsize) {
        self.max_concurrency
            .store(max_concurrency.get(), Ordering::SeqCst);
    }

    fn submit(&self, task: Task<'scope>) {
        self.shared.pending.notify_all_with(|pending| *pending += 1);
        let shared = Arc::clone(&self.shared);
        self.scope.spawn(move |_| {
            if shared.cancelled.load(Ordering::SeqCst) {
                log_debug!("Dropping a task cancelled before it started");
                // The task and everything it captures must be gone before the
                // pending count drops, like on the path that runs it.
                drop(task);
            } else if catch_unwind(AssertUnwindSafe(task)).is_err() {
                // Contained here so that the panic doesn't resurface when the
                // Rayon scope joins.
                log_error!("A task panicked on the Rayon pool");
            }
            shared.pending.notify_all_with(|pending| *pending -= 1);
        });
    }

    fn await_all_completed(&self) {
        // The caller of `rayon_core::scope` is itself running on a pool
        // worker thread. Parking that worker on the condvar would starve the
        // tasks this barrier waits for when no other worker is free, so on a
        // worker thread the wait keeps draining the pool instead.
        while *self.shared.pending.lock() > 0 {
            match rayon_core::yield_now() {
                Some(Yield::Executed) => {}
                Some(Yield::Idle) => std::thread::yield_now(),
                None => {
                    // Not on a pool worker: blocking is safe.
                    let _guard = self.shared.pending.wait_while(|pending| *pending > 0);
                    return;
                }
            }
        }
    }

    fn cancel_all(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }
}
