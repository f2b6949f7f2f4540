//! Bounded concurrency for split branches and parallel loop iterations
//!
//! A fixed number of workers pull task indices from a shared counter. Tasks
//! are closures, so nothing starts before a worker claims it, and every
//! outcome is kept at its input index.

use futures::future::join_all;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settled<T, E> {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settled::Fulfilled(_))
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Settled::Fulfilled(value) => Ok(value),
            Settled::Rejected(reason) => Err(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Settled<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Settled::Fulfilled(value),
            Err(reason) => Settled::Rejected(reason),
        }
    }
}

/// Run `tasks` with at most `pool_size` in flight
///
/// The result has one entry per task, in input order. A pool size of zero
/// is treated as one.
pub async fn run_bounded<T, E, F, Fut>(tasks: Vec<F>, pool_size: usize) -> Vec<Settled<T, E>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }

    let workers = pool_size.clamp(1, total);
    let next_index = AtomicUsize::new(0);
    let pending: Mutex<Vec<Option<F>>> = Mutex::new(tasks.into_iter().map(Some).collect());
    let results: Mutex<Vec<Option<Settled<T, E>>>> =
        Mutex::new((0..total).map(|_| None).collect());

    let worker = |worker_id: usize| {
        let next_index = &next_index;
        let pending = &pending;
        let results = &results;
        async move {
            loop {
                let index = next_index.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }

                let task = pending
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())[index]
                    .take();
                let Some(task) = task else { continue };

                tracing::trace!(worker = worker_id, task = index, "claimed task");
                let settled = Settled::from(task().await);

                results
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())[index] = Some(settled);
            }
        }
    };

    join_all((0..workers).map(worker)).await;

    results
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .flatten()
        .collect()
}
