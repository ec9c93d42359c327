// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Concrete executor implementations.

#[cfg(feature = "rayon")]
mod rayon;
mod thread_pool;

#[cfg(feature = "rayon")]
pub use rayon::RayonExecutor;
pub use thread_pool::{ThreadPoolBuilder, ThreadPoolExecutor};
