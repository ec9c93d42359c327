// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The capability contract that concrete task schedulers must satisfy.

use std::num::NonZeroUsize;

/// A zero-argument unit of work submitted to an [`Executor`].
///
/// Tasks are tied to the `'scope` lifetime of the executor they are submitted
/// to, so they can borrow data owned by the caller as long as that data
/// outlives the scope.
pub type Task<'scope> = Box<dyn FnOnce() + Send + 'scope>;

/// A bounded-concurrency task scheduler.
///
/// The parallel operations of [`ParallelSlice`](crate::ParallelSlice) depend
/// only on this contract: they submit tasks, block on the completion barrier,
/// and otherwise never interact with the scheduler's internals. Any concrete
/// scheduler (a fixed worker pool such as
/// [`ThreadPoolExecutor`](crate::ThreadPoolExecutor), a pool borrowed from
/// another library, an OS thread pool) can drive them by implementing this
/// trait, preferably as an adaptor type composing the scheduler rather than
/// as a blanket conformance on it.
///
/// The executor is owned by the caller and outlives any single parallel
/// operation; operations only use it for their own duration.
pub trait Executor<'scope> {
    /// Returns the upper bound on simultaneously running tasks.
    fn max_concurrency(&self) -> NonZeroUsize;

    /// Reconfigures the upper bound on simultaneously running tasks.
    ///
    /// Takes effect for tasks that haven't started running yet. The bound is
    /// at least 1 by construction of [`NonZeroUsize`].
    fn set_max_concurrency(&self, max_concurrency: NonZeroUsize);

    /// Enqueues a task for asynchronous execution.
    ///
    /// The task must not run synchronously on the calling thread. Beyond the
    /// concurrency bound, the order in which submitted tasks execute is
    /// unspecified.
    fn submit(&self, task: Task<'scope>);

    /// Blocks the calling thread until every task submitted before this call
    /// has finished.
    ///
    /// A task that panics internally still counts as finished: the panic is
    /// contained by the executor and is not propagated to the caller of this
    /// method.
    fn await_all_completed(&self);

    /// Best-effort cancellation: drops tasks that haven't started running and
    /// signals running ones to stop where the underlying scheduler supports
    /// it.
    ///
    /// There is no guarantee that already-running tasks stop promptly, or at
    /// all.
    fn cancel_all(&self);
}
