// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod executor;
mod macros;
mod slice;
mod sync;
mod threads;

pub use executor::{Executor, Task};
pub use slice::ParallelSlice;
pub use sync::SharedValue;
#[cfg(feature = "rayon")]
pub use threads::RayonExecutor;
pub use threads::{ThreadPoolBuilder, ThreadPoolExecutor};

#[cfg(test)]
mod test {
    use super::*;
    use std::convert::Infallible;
    use std::num::NonZeroUsize;

    /// The scenario transform: an integer square root.
    fn sqrt(value: &u64) -> Result<f64, Infallible> {
        Ok((*value as f64).sqrt())
    }

    /// The scenario combine: an addition (associative and commutative).
    fn add(current: &u64, value: &u64) -> Result<u64, Infallible> {
        Ok(current + value)
    }

    fn scenario_input() -> Vec<u64> {
        (1..=1_000).collect()
    }

    fn executor_builder(num_threads: usize, max_concurrency: usize) -> ThreadPoolBuilder {
        let _ = env_logger::builder().is_test(true).try_init();
        ThreadPoolBuilder {
            num_threads: NonZeroUsize::try_from(num_threads).unwrap(),
            max_concurrency: NonZeroUsize::try_from(max_concurrency).unwrap(),
        }
    }

    macro_rules! expand_tests {
        ( ($num_threads:expr, $max_concurrency:expr), ) => {};
        ( ($num_threads:expr, $max_concurrency:expr), $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($num_threads, $max_concurrency);
            }

            expand_tests!(($num_threads, $max_concurrency), $($others)*);
        };
    }

    macro_rules! executor_tests {
        ( $mod:ident, $num_threads:expr, $max_concurrency:expr ) => {
            mod $mod {
                expand_tests!(
                    ($num_threads, $max_concurrency),
                    parallel_map_matches_sequential_map,
                    parallel_map_is_idempotent,
                    parallel_reduce_matches_sequential_reduce,
                    partitioned_parallel_map_matches_sequential_map,
                    partitioned_parallel_reduce_matches_sequential_reduce,
                    partitioned_ops_fall_back_to_sequential,
                    random_partition_counts_match_sequential_map,
                    failing_transform_leaves_absent_slots,
                    failing_combine_contributes_nothing,
                    failing_combine_in_partitions_contributes_nothing,
                    panicking_transform_leaves_absent_slots,
                );
            }
        };
    }

    executor_tests!(single_worker, 1, 1);
    executor_tests!(four_workers, 4, 4);
    executor_tests!(ten_workers, 10, 10);
    executor_tests!(oversubscribed, 4, 100);

    fn parallel_map_matches_sequential_map(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();
        let sequential: Vec<f64> = input.iter().map(|x| (*x as f64).sqrt()).collect();

        let parallel = executor_builder(num_threads, max_concurrency)
            .scope(|executor| input.parallel_map(executor, sqrt));

        assert_eq!(parallel.len(), input.len());
        for (i, value) in sequential.iter().enumerate() {
            assert_eq!(parallel[i], Some(*value));
        }
    }

    fn parallel_map_is_idempotent(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();
        let builder = executor_builder(num_threads, max_concurrency);

        let first = builder.scope(|executor| input.parallel_map(executor, sqrt));
        let second = builder.scope(|executor| input.parallel_map(executor, sqrt));
        assert_eq!(first, second);
    }

    fn parallel_reduce_matches_sequential_reduce(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();
        // 11 + sum of 1..=1000.
        let expected = 500_511;

        let sum = executor_builder(num_threads, max_concurrency)
            .scope(|executor| input.parallel_reduce(executor, 11, add));
        assert_eq!(sum, expected);
    }

    fn partitioned_parallel_map_matches_sequential_map(
        num_threads: usize,
        max_concurrency: usize,
    ) {
        let input = scenario_input();
        let sequential: Vec<f64> = input.iter().map(|x| (*x as f64).sqrt()).collect();

        executor_builder(num_threads, max_concurrency).scope(|executor| {
            for partitions in [1, 17, 32, 71, input.len() - 1] {
                let parallel = input
                    .partitioned_parallel_map(executor, partitions, sqrt)
                    .unwrap();
                assert_eq!(parallel.len(), input.len());
                for (i, value) in sequential.iter().enumerate() {
                    assert_eq!(parallel[i], Some(*value));
                }
            }
        });
    }

    fn partitioned_parallel_reduce_matches_sequential_reduce(
        num_threads: usize,
        max_concurrency: usize,
    ) {
        let input = scenario_input();

        executor_builder(num_threads, max_concurrency).scope(|executor| {
            for partitions in [1, 17, 32, 71, input.len() - 1] {
                let sum = input
                    .partitioned_parallel_reduce(executor, partitions, 11, add)
                    .unwrap();
                assert_eq!(sum, 500_511);
            }
        });
    }

    fn partitioned_ops_fall_back_to_sequential(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();
        let sequential: Vec<Option<f64>> =
            input.iter().map(|x| Some((*x as f64).sqrt())).collect();

        executor_builder(num_threads, max_concurrency).scope(|executor| {
            // Zero partitions, and more partitions than elements: both are
            // defined to bypass the parallel dispatch entirely.
            for partitions in [0, input.len(), 50_000] {
                let mapped = input
                    .partitioned_parallel_map(executor, partitions, sqrt)
                    .unwrap();
                assert_eq!(mapped, sequential);

                let sum = input
                    .partitioned_parallel_reduce(executor, partitions, 11, add)
                    .unwrap();
                assert_eq!(sum, 500_511);
            }
        });
    }

    fn random_partition_counts_match_sequential_map(num_threads: usize, max_concurrency: usize) {
        use rand::{Rng, SeedableRng};

        let input = scenario_input();
        let sequential: Vec<f64> = input.iter().map(|x| (*x as f64).sqrt()).collect();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0x5eed);

        executor_builder(num_threads, max_concurrency).scope(|executor| {
            for _ in 0..10 {
                let partitions = rng.random_range(1..input.len());
                let parallel = input
                    .partitioned_parallel_map(executor, partitions, sqrt)
                    .unwrap();
                for (i, value) in sequential.iter().enumerate() {
                    assert_eq!(parallel[i], Some(*value));
                }
            }
        });
    }

    fn failing_transform_leaves_absent_slots(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();

        let parallel = executor_builder(num_threads, max_concurrency).scope(|executor| {
            input.parallel_map(executor, |x| {
                if *x % 2 == 1 {
                    Err("odd input")
                } else {
                    Ok(*x / 2)
                }
            })
        });

        assert_eq!(parallel.len(), input.len());
        for (i, slot) in parallel.iter().enumerate() {
            let x = input[i];
            if x % 2 == 1 {
                assert_eq!(*slot, None);
            } else {
                assert_eq!(*slot, Some(x / 2));
            }
        }
    }

    fn failing_combine_contributes_nothing(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();
        let expected = 11 + input.iter().filter(|x| *x % 3 != 0).sum::<u64>();

        let sum = executor_builder(num_threads, max_concurrency).scope(|executor| {
            input.parallel_reduce(executor, 11, |current, x| {
                if *x % 3 == 0 {
                    Err("multiple of three")
                } else {
                    Ok(current + x)
                }
            })
        });
        assert_eq!(sum, expected);
    }

    fn failing_combine_in_partitions_contributes_nothing(
        num_threads: usize,
        max_concurrency: usize,
    ) {
        let input = scenario_input();
        let expected = 11 + input.iter().filter(|x| *x % 3 != 0).sum::<u64>();

        executor_builder(num_threads, max_concurrency).scope(|executor| {
            for partitions in [1, 17, 71] {
                // A failing element inside a partition's local fold is
                // skipped; the rest of the partition still folds in.
                let sum = input
                    .partitioned_parallel_reduce(executor, partitions, 11, |current, x| {
                        if *x % 3 == 0 {
                            Err("multiple of three")
                        } else {
                            Ok(current + x)
                        }
                    })
                    .unwrap();
                assert_eq!(sum, expected);
            }
        });
    }

    fn panicking_transform_leaves_absent_slots(num_threads: usize, max_concurrency: usize) {
        let input = scenario_input();

        // A panic inside a task is contained by the executor: the operation
        // still completes and the element's slot is simply never written.
        let parallel = executor_builder(num_threads, max_concurrency).scope(|executor| {
            input.parallel_map(executor, |x| {
                if *x == 500 {
                    panic!("transform panic");
                }
                Ok::<_, Infallible>(*x)
            })
        });

        assert_eq!(parallel.len(), input.len());
        for (i, slot) in parallel.iter().enumerate() {
            if input[i] == 500 {
                assert_eq!(*slot, None);
            } else {
                assert_eq!(*slot, Some(input[i]));
            }
        }
    }
}
