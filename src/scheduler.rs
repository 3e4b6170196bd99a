//! Worker pool handle shared by every parallel operation.
//!
//! The pool is sized once and built on first use. Components receive a
//! `&Scheduler` and run their parallel iterators inside [`Scheduler::install`],
//! so tests can pick a single-threaded pool for deterministic runs.

use std::num::NonZeroUsize;

use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::{Error, Result};

pub struct Scheduler {
    num_threads: usize,
    pool: OnceCell<rayon::ThreadPool>,
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl Scheduler {
    /// Pool with `requested` threads, clamped to the available cores.
    ///
    /// `0` uses every available core.
    pub fn new(requested: usize) -> Self {
        let available = available_threads();
        let num_threads = match requested {
            0 => available,
            n if n > available => {
                warn!(
                    "requested {} threads, but only {} are available; using {}",
                    n, available, available
                );
                available
            }
            n => n,
        };

        Self {
            num_threads,
            pool: OnceCell::new(),
        }
    }

    /// Single-threaded pool, mostly for tests.
    pub fn single() -> Self {
        Self::new(1)
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn pool(&self) -> Result<&rayon::ThreadPool> {
        self.pool.get_or_try_init(|| {
            debug!("starting worker pool with {} threads", self.num_threads);
            rayon::ThreadPoolBuilder::new()
                .num_threads(self.num_threads)
                .thread_name(|i| format!("branchwater-{i}"))
                .build()
                .map_err(|e| Error::Scheduler {
                    message: e.to_string(),
                })
        })
    }

    /// Run `op` inside the pool; parallel iterators in `op` use its threads.
    pub fn install<OP, R>(&self, op: OP) -> Result<R>
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        Ok(self.pool()?.install(op))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(0)
    }
}
