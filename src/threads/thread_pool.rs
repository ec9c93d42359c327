// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A scoped worker-pool executor.

use crate::executor::{Executor, Task};
use crate::macros::{log_debug, log_error, log_warn};
use crate::sync::Status;
use crossbeam_utils::CachePadded;
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{Scope, ScopedJoinHandle};

/// A builder for [`ThreadPoolExecutor`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: NonZeroUsize,
    /// Initial upper bound on simultaneously running tasks.
    pub max_concurrency: NonZeroUsize,
}

impl ThreadPoolBuilder {
    /// Spawns a scoped worker pool and passes it to the given function.
    ///
    /// The pool implements [`Executor`], so it can drive the operations of
    /// [`ParallelSlice`](crate::ParallelSlice) directly. Tasks may borrow any
    /// data that outlives this call. The workers are joined before this
    /// returns; tasks still queued at that point are discarded.
    ///
    /// ```rust
    /// # use parslice::{ParallelSlice, ThreadPoolBuilder};
    /// # use std::convert::Infallible;
    /// # use std::num::NonZeroUsize;
    /// let builder = ThreadPoolBuilder {
    ///     num_threads: NonZeroUsize::try_from(4).unwrap(),
    ///     max_concurrency: NonZeroUsize::try_from(4).unwrap(),
    /// };
    ///
    /// let input = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
    /// let sum = builder.scope(|executor| {
    ///     input.parallel_reduce(executor, 0, |acc, x| Ok::<_, Infallible>(acc + x))
    /// });
    /// assert_eq!(sum, 5 * 11);
    /// ```
    pub fn scope<'env, R>(
        &self,
        f: impl for<'scope> FnOnce(&ThreadPoolExecutor<'scope, 'env>) -> R,
    ) -> R {
        std::thread::scope(|scope| {
            let executor = ThreadPoolExecutor::new(scope, self.num_threads, self.max_concurrency);
            f(&executor)
        })
    }
}

/// State shared between the pool handle and its worker threads.
struct PoolState<'scope> {
    /// Tasks submitted but not started yet.
    queue: VecDeque<Task<'scope>>,
    /// Number of tasks currently running on worker threads.
    running: usize,
    /// Set when the pool is dropped; workers exit once they observe it.
    shutdown: bool,
}

/// A fixed pool of worker threads implementing the [`Executor`] contract.
///
/// Workers are spawned on a [`std::thread::scope`], so submitted tasks can
/// borrow data owned by the caller of [`ThreadPoolBuilder::scope()`]. At most
/// [`max_concurrency`](Executor::max_concurrency) tasks run simultaneously,
/// even when more workers are available; the bound can be raised or lowered
/// at any time and applies to tasks that haven't started yet.
///
/// A panicking task is contained by the worker that ran it: the pool stays
/// usable and [`await_all_completed()`](Executor::await_all_completed)
/// returns normally.
pub struct ThreadPoolExecutor<'scope, 'env> {
    /// Queue and counters shared with the workers.
    state: Arc<Status<PoolState<'scope>>>,
    /// Upper bound on simultaneously running tasks.
    max_concurrency: Arc<CachePadded<AtomicUsize>>,
    /// Handles to all the worker threads in the pool.
    workers: Vec<ScopedJoinHandle<'scope, ()>>,
    /// Invariance over `'env`, mirroring [`std::thread::Scope`] so that
    /// submitted tasks can borrow from the caller's environment.
    env: PhantomData<&'scope mut &'env ()>,
}

impl<'scope, 'env> ThreadPoolExecutor<'scope, 'env> {
    /// Spawns the worker threads on the given scope.
    fn new(
        scope: &'scope Scope<'scope, 'env>,
        num_threads: NonZeroUsize,
        max_concurrency: NonZeroUsize,
    ) -> Self {
        let state = Arc::new(Status::new(PoolState {
            queue: VecDeque::new(),
            running: 0,
            shutdown: false,
        }));
        let max_concurrency = Arc::new(CachePadded::new(AtomicUsize::new(max_concurrency.get())));

        let workers = (0..num_threads.get())
            .map(|id| {
                let state = Arc::clone(&state);
                let max_concurrency = Arc::clone(&max_concurrency);
                scope.spawn(move || worker_loop(id, &state, &max_concurrency))
            })
            .collect();
        log_debug!("[main thread] Spawned {num_threads} worker threads");

        Self {
            state,
            max_concurrency,
            workers,
            env: PhantomData,
        }
    }
}

impl<'scope, 'env> Executor<'scope> for ThreadPoolExecutor<'scope, 'env> {
    fn max_concurrency(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_concurrency.load(Ordering::SeqCst))
            .expect("the concurrency bound is always non-zero")
    }

    fn set_max_concurrency(&self, max_concurrency: NonZeroUsize) {
        self.max_concurrency
            .store(max_concurrency.get(), Ordering::SeqCst);
        // A raised bound may allow sleeping workers to start queued tasks.
        self.state.notify_all_with(|_| ());
    }

    fn submit(&self, task: Task<'scope>) {
        // Workers and barrier waiters share the condvar, so a single wakeup
        // could land on a waiter and leave every worker asleep until the
        // next task completion.
        self.state.notify_all_with(|pool| pool.queue.push_back(task));
    }

    fn await_all_completed(&self) {
        let _guard = self
            .state
            .wait_while(|pool| !pool.queue.is_empty() || pool.running > 0);
    }

    fn cancel_all(&self) {
        let _dropped = self.state.notify_all_with(|pool| {
            let dropped = pool.queue.len();
            pool.queue.clear();
            dropped
        });
        log_debug!("[main thread] Cancelled {_dropped} queued task(s)");
    }
}

impl Drop for ThreadPoolExecutor<'_, '_> {
    /// Joins all the threads in the pool.
    #[allow(clippy::unused_enumerate_index)]
    fn drop(&mut self) {
        log_debug!("[main thread] Notifying workers to finish...");
        self.state.notify_all_with(|pool| pool.shutdown = true);

        for (_i, worker) in self.workers.drain(..).enumerate() {
            match worker.join() {
                Ok(()) => log_debug!("[main thread] Worker {_i} joined"),
                Err(_) => log_error!("[main thread] Worker {_i} exited by panicking"),
            }
        }
        log_debug!("[main thread] Joined workers.");
    }
}

/// Main function run by each worker thread.
fn worker_loop<'scope>(
    id: usize,
    state: &Status<PoolState<'scope>>,
    max_concurrency: &AtomicUsize,
) {
    pin_current_thread(id);

    loop {
        let mut guard = state.wait_while(|pool| {
            !pool.shutdown
                && (pool.queue.is_empty() || pool.running >= max_concurrency.load(Ordering::SeqCst))
        });
        if guard.shutdown {
            log_debug!("[worker {id}] Received shutdown signal");
            break;
        }
        let Some(task) = guard.queue.pop_front() else {
            continue;
        };
        guard.running += 1;
        drop(guard);

        log_debug!("[worker {id}] Picked up a task");
        let outcome = catch_unwind(AssertUnwindSafe(task));
        if outcome.is_err() {
            log_error!("[worker {id}] A submitted task panicked");
        }

        // Wakes both barrier waiters and workers gated by the concurrency
        // bound.
        state.notify_all_with(|pool| pool.running -= 1);
    }
}

/// Pins the current worker thread to the CPU matching its index.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
fn pin_current_thread(id: usize) {
    let mut cpu_set = CpuSet::new();
    if let Err(_e) = cpu_set.set(id) {
        log_warn!("Failed to set CPU affinity for worker #{id}: {_e}");
    } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        log_warn!("Failed to set CPU affinity for worker #{id}: {_e}");
    } else {
        log_debug!("Pinned worker #{id} to CPU #{id}");
    }
}

/// Pins the current worker thread to the CPU matching its index.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
fn pin_current_thread(_id: usize) {
    log_warn!("Pinning threads to CPUs is not implemented on this platform.");
}
