// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Parallel map and reduce operations over slices.
//!
//! Two scheduling shapes are provided. The whole-collection operations fan
//! out one task per element and throttle submissions against the executor's
//! concurrency bound. The partitioned operations split the slice into
//! contiguous index ranges, with one task processing each range sequentially
//! before writing back in a single critical section.

use crate::executor::Executor;
use crate::macros::log_debug;
use crate::sync::SharedValue;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Parallel map and reduce operations, implemented for any slice of [`Sync`]
/// elements.
///
/// All operations preserve element order: map results live at the index of
/// the element they were computed from, and every output slot is written
/// exactly once by exactly one task.
///
/// Transform and combine functions return a [`Result`]. On the parallel
/// paths a failing element is swallowed: it yields an absent (`None`) map
/// slot, or an unchanged accumulator contribution, and is neither retried nor
/// allowed to abort the remaining elements. Only the sequential fallbacks of
/// the partitioned operations propagate failures to the caller.
pub trait ParallelSlice<E: Sync> {
    /// Transforms every element concurrently, one task per element, and
    /// returns the results in input order.
    ///
    /// After every `max_concurrency`-th submission (read from the executor),
    /// this blocks on [`Executor::await_all_completed()`] so the queue never
    /// grows far ahead of the executor's draining capacity.
    ///
    /// Elements whose transform fails come back as `None`; all others come
    /// back as `Some(transform(element))`, exactly matching a sequential map.
    ///
    /// ```rust
    /// # use parslice::{ParallelSlice, ThreadPoolBuilder};
    /// # use std::convert::Infallible;
    /// # use std::num::NonZeroUsize;
    /// # let builder = ThreadPoolBuilder {
    /// #     num_threads: NonZeroUsize::try_from(2).unwrap(),
    /// #     max_concurrency: NonZeroUsize::try_from(2).unwrap(),
    /// # };
    /// let input = vec![1.0f64, 4.0, 9.0, 16.0];
    /// let roots = builder.scope(|executor| {
    ///     input.parallel_map(executor, |x| Ok::<_, Infallible>(x.sqrt()))
    /// });
    /// assert_eq!(roots, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    /// ```
    fn parallel_map<'scope, T, Er, F, X>(&'scope self, executor: &X, transform: F) -> Vec<Option<T>>
    where
        T: Send + 'scope,
        F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
        X: Executor<'scope>;

    /// Like [`parallel_map()`](Self::parallel_map), but throttles submissions
    /// with the given stride instead of the executor's maximum concurrency.
    fn parallel_map_throttled<'scope, T, Er, F, X>(
        &'scope self,
        executor: &X,
        throttle: NonZeroUsize,
        transform: F,
    ) -> Vec<Option<T>>
    where
        T: Send + 'scope,
        F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
        X: Executor<'scope>;

    /// Folds all elements into a single accumulator, one task per element,
    /// starting from `initial`.
    ///
    /// Each task reads the current accumulator, applies `combine` to it and
    /// its element, and replaces the accumulator with the result, all under
    /// exclusive access. A failing `combine` leaves the accumulator unchanged
    /// for that element's contribution; this is why `combine` borrows the
    /// accumulator instead of consuming it. Submissions are throttled as in
    /// [`parallel_map()`](Self::parallel_map).
    ///
    /// Tasks acquire exclusive access in an unspecified order, so the result
    /// is deterministic only if `combine` is associative and commutative over
    /// the elements actually folded in. Callers relying on a specific fold
    /// order must not use this operation.
    ///
    /// ```rust
    /// # use parslice::{ParallelSlice, ThreadPoolBuilder};
    /// # use std::convert::Infallible;
    /// # use std::num::NonZeroUsize;
    /// # let builder = ThreadPoolBuilder {
    /// #     num_threads: NonZeroUsize::try_from(2).unwrap(),
    /// #     max_concurrency: NonZeroUsize::try_from(2).unwrap(),
    /// # };
    /// let input: Vec<u64> = (1..=10).collect();
    /// let sum = builder.scope(|executor| {
    ///     input.parallel_reduce(executor, 0u64, |acc, x| Ok::<_, Infallible>(acc + x))
    /// });
    /// assert_eq!(sum, 55);
    /// ```
    fn parallel_reduce<'scope, A, Er, F, X>(&'scope self, executor: &X, initial: A, combine: F) -> A
    where
        A: Send + 'scope,
        F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
        X: Executor<'scope>;

    /// Like [`parallel_reduce()`](Self::parallel_reduce), but throttles
    /// submissions with the given stride instead of the executor's maximum
    /// concurrency.
    fn parallel_reduce_throttled<'scope, A, Er, F, X>(
        &'scope self,
        executor: &X,
        throttle: NonZeroUsize,
        initial: A,
        combine: F,
    ) -> A
    where
        A: Send + 'scope,
        F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
        X: Executor<'scope>;

    /// Transforms every element concurrently, one task per contiguous
    /// partition of `len() / partitions` elements (plus one task for the
    /// leftover elements of the floor division, if any).
    ///
    /// Each task maps its whole partition locally, turning per-element
    /// failures into `None` without aborting the rest of the partition, then
    /// overwrites its index range of the results buffer in one atomic range
    /// replace. The partitions exactly tile the input: every index is covered
    /// by exactly one task.
    ///
    /// Requesting zero partitions, or at least as many partitions as
    /// elements, falls back to a plain sequential map with no parallel
    /// dispatch; on that path a failing transform propagates to the caller
    /// as `Err` instead of producing an absent slot. The parallel path always
    /// returns `Ok`.
    fn partitioned_parallel_map<'scope, T, Er, F, X>(
        &'scope self,
        executor: &X,
        partitions: usize,
        transform: F,
    ) -> Result<Vec<Option<T>>, Er>
    where
        T: Send + 'scope,
        F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
        X: Executor<'scope>;

    /// Folds all elements into a single accumulator, one task per contiguous
    /// partition, with the same partitioning and fallback rules as
    /// [`partitioned_parallel_map()`](Self::partitioned_parallel_map).
    ///
    /// Each task performs its entire sequential fold inside a single
    /// exclusive-access critical section: it reads the current shared
    /// accumulator, applies `combine` across its whole partition (a failing
    /// element leaves the running value unchanged), and writes the folded
    /// value back, so no other partition's write can interleave mid-fold.
    ///
    /// The same determinism caveat as
    /// [`parallel_reduce()`](Self::parallel_reduce) applies across
    /// partitions.
    fn partitioned_parallel_reduce<'scope, A, Er, F, X>(
        &'scope self,
        executor: &X,
        partitions: usize,
        initial: A,
        combine: F,
    ) -> Result<A, Er>
    where
        A: Send + 'scope,
        F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
        X: Executor<'scope>;
}

impl<E: Sync> ParallelSlice<E> for [E] {
    fn parallel_map<'scope, T, Er, F, X>(&'scope self, executor: &X, transform: F) -> Vec<Option<T>>
    where
        T: Send + 'scope,
        F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
        X: Executor<'scope>,
    {
        fan_out_map(self, executor, None, transform)
    }

    fn parallel_map_throttled<'scope, T, Er, F, X>(
        &'scope self,
        executor: &X,
        throttle: NonZeroUsize,
        transform: F,
    ) -> Vec<Option<T>>
    where
        T: Send + 'scope,
        F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
        X: Executor<'scope>,
    {
        fan_out_map(self, executor, Some(throttle), transform)
    }

    fn parallel_reduce<'scope, A, Er, F, X>(&'scope self, executor: &X, initial: A, combine: F) -> A
    where
        A: Send + 'scope,
        F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
        X: Executor<'scope>,
    {
        fan_out_reduce(self, executor, None, initial, combine)
    }

    fn parallel_reduce_throttled<'scope, A, Er, F, X>(
        &'scope self,
        executor: &X,
        throttle: NonZeroUsize,
        initial: A,
        combine: F,
    ) -> A
    where
        A: Send + 'scope,
        F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
        X: Executor<'scope>,
    {
        fan_out_reduce(self, executor, Some(throttle), initial, combine)
    }

    fn partitioned_parallel_map<'scope, T, Er, F, X>(
        &'scope self,
        executor: &X,
        partitions: usize,
        transform: F,
    ) -> Result<Vec<Option<T>>, Er>
    where
        T: Send + 'scope,
        F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
        X: Executor<'scope>,
    {
        let n = self.len();
        if partitions == 0 || partitions >= n {
            log_debug!("partitioned map: falling back to a sequential map of {n} elements");
            return self.iter().map(|item| transform(item).map(Some)).collect();
        }

        let results = Arc::new(SharedValue::new(empty_results(n)));
        let transform = Arc::new(transform);

        let mut last_end = 0;
        for (start, end) in partition_bounds(n, partitions) {
            last_end = end;
            submit_map_partition(executor, &results, &transform, &self[start..end], start);
        }
        // Leftover elements from the floor division.
        if last_end < n {
            submit_map_partition(executor, &results, &transform, &self[last_end..], last_end);
        }

        executor.await_all_completed();
        Ok(collect(results))
    }

    fn partitioned_parallel_reduce<'scope, A, Er, F, X>(
        &'scope self,
        executor: &X,
        partitions: usize,
        initial: A,
        combine: F,
    ) -> Result<A, Er>
    where
        A: Send + 'scope,
        F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
        X: Executor<'scope>,
    {
        let n = self.len();
        if partitions == 0 || partitions >= n {
            log_debug!("partitioned reduce: falling back to a sequential fold of {n} elements");
            return self
                .iter()
                .try_fold(initial, |accumulator, item| combine(&accumulator, item));
        }

        let result = Arc::new(SharedValue::new(initial));
        let combine = Arc::new(combine);

        let mut last_end = 0;
        for (start, end) in partition_bounds(n, partitions) {
            last_end = end;
            submit_reduce_partition(executor, &result, &combine, &self[start..end]);
        }
        if last_end < n {
            submit_reduce_partition(executor, &result, &combine, &self[last_end..]);
        }

        executor.await_all_completed();
        Ok(collect(result))
    }
}

/// Whole-collection parallel map: one task per element, writing its (possibly
/// absent) value at the element's own index.
fn fan_out_map<'scope, E, T, Er, F, X>(
    slice: &'scope [E],
    executor: &X,
    throttle: Option<NonZeroUsize>,
    transform: F,
) -> Vec<Option<T>>
where
    E: Sync,
    T: Send + 'scope,
    F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
    X: Executor<'scope>,
{
    log_debug!("parallel map: fanning out {} tasks", slice.len());
    let results = Arc::new(SharedValue::new(empty_results(slice.len())));
    let transform = Arc::new(transform);

    for (i, item) in slice.iter().enumerate() {
        let results = Arc::clone(&results);
        let transform = Arc::clone(&transform);
        executor.submit(Box::new(move || {
            // The transform runs outside the critical section; only the
            // write-once store of slot `i` happens under exclusive access.
            let value = transform(item).ok();
            results.with_exclusive(|buffer| buffer[i] = value);
        }));

        if i % stride(executor, throttle) == 0 {
            // Avoid overloading the queue with too many pending tasks.
            executor.await_all_completed();
        }
    }

    executor.await_all_completed();
    collect(results)
}

/// Whole-collection parallel reduce: one task per element, each performing a
/// read-combine-replace of the shared accumulator under exclusive access.
fn fan_out_reduce<'scope, E, A, Er, F, X>(
    slice: &'scope [E],
    executor: &X,
    throttle: Option<NonZeroUsize>,
    initial: A,
    combine: F,
) -> A
where
    E: Sync,
    A: Send + 'scope,
    F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
    X: Executor<'scope>,
{
    log_debug!("parallel reduce: fanning out {} tasks", slice.len());
    let result = Arc::new(SharedValue::new(initial));
    let combine = Arc::new(combine);

    for (i, item) in slice.iter().enumerate() {
        let result = Arc::clone(&result);
        let combine = Arc::clone(&combine);
        executor.submit(Box::new(move || {
            result.with_exclusive(|accumulator| {
                if let Ok(next) = combine(accumulator, item) {
                    *accumulator = next;
                }
            });
        }));

        if i % stride(executor, throttle) == 0 {
            executor.await_all_completed();
        }
    }

    executor.await_all_completed();
    collect(result)
}

/// Submits one partitioned-map task covering `chunk`, which starts at index
/// `start` of the full slice.
fn submit_map_partition<'scope, E, T, Er, F, X>(
    executor: &X,
    results: &Arc<SharedValue<Vec<Option<T>>>>,
    transform: &Arc<F>,
    chunk: &'scope [E],
    start: usize,
) where
    E: Sync,
    T: Send + 'scope,
    F: Fn(&E) -> Result<T, Er> + Send + Sync + 'scope,
    X: Executor<'scope>,
{
    log_debug!(
        "partitioned map: submitting range [{start}, {})",
        start + chunk.len()
    );
    let results = Arc::clone(results);
    let transform = Arc::clone(transform);
    executor.submit(Box::new(move || {
        let partial: Vec<Option<T>> = chunk.iter().map(|item| transform(item).ok()).collect();
        results.with_exclusive(|buffer| {
            // One atomic range replace of [start, start + len).
            for (slot, value) in buffer[start..].iter_mut().zip(partial) {
                *slot = value;
            }
        });
    }));
}

/// Submits one partitioned-reduce task covering `chunk`.
fn submit_reduce_partition<'scope, E, A, Er, F, X>(
    executor: &X,
    result: &Arc<SharedValue<A>>,
    combine: &Arc<F>,
    chunk: &'scope [E],
) where
    E: Sync,
    A: Send + 'scope,
    F: Fn(&A, &E) -> Result<A, Er> + Send + Sync + 'scope,
    X: Executor<'scope>,
{
    log_debug!("partitioned reduce: submitting a range of {} elements", chunk.len());
    let result = Arc::clone(result);
    let combine = Arc::clone(combine);
    executor.submit(Box::new(move || {
        // The whole local fold happens inside one critical section, so no
        // other partition's write can interleave mid-fold.
        result.with_exclusive(|accumulator| {
            for item in chunk {
                if let Ok(next) = combine(accumulator, item) {
                    *accumulator = next;
                }
            }
        });
    }));
}

/// The half-open index ranges of the regular partitions; the leftover range
/// `[partitions * (n / partitions), n)` is not included.
///
/// Requires `0 < partitions < n`, which the fallback checks of the
/// partitioned operations guarantee.
fn partition_bounds(n: usize, partitions: usize) -> impl Iterator<Item = (usize, usize)> {
    let partition_size = n / partitions;
    (0..partitions).map(move |k| {
        let start = k * partition_size;
        (start, usize::min(start + partition_size, n))
    })
}

/// A results buffer of `len` absent entries.
fn empty_results<T>(len: usize) -> Vec<Option<T>> {
    (0..len).map(|_| None).collect()
}

/// The throttling stride: the explicit one if given, the executor's maximum
/// concurrency otherwise.
fn stride<'scope, X: Executor<'scope>>(executor: &X, throttle: Option<NonZeroUsize>) -> usize {
    throttle.unwrap_or_else(|| executor.max_concurrency()).get()
}

/// Reads the final value out of the shared container once all tasks have
/// completed and dropped their handles to it.
fn collect<V>(shared: Arc<SharedValue<V>>) -> V {
    match Arc::try_unwrap(shared) {
        Ok(value) => value.into_inner(),
        Err(_) => panic!("the executor reported completion while tasks were still alive"),
    }
}
