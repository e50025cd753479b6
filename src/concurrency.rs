//! Bounded concurrency for fan-out calls to the build server.
//!
//! Every item is dispatched up front but has to hold a permit from a shared
//! [`ConcurrencyLimiter`] while it runs, so at most `limit` operations are in
//! flight and the rest wait their turn. A failing item does not cancel its
//! siblings: everything dispatched runs to completion and the first error (in
//! item order) is reported afterwards.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use log::debug;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Counting semaphore. Dropping the returned permit releases it.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Waits for a free slot. Fails only once the limiter is closed.
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.semaphore.acquire().await
    }

    /// Rejects all pending and future [`acquire`](Self::acquire) calls.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.limit - self.available()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

/// Runs `operation` over all `items` with at most `limit` in flight.
///
/// Results keep item order. If any item fails the whole call fails with the
/// first error, after every item has finished.
pub async fn parallel_limit<I, T, R, E, F, Fut>(items: I, limit: usize, operation: F) -> Result<Vec<R>, E>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let limiter = ConcurrencyLimiter::new(limit);
    let limiter = &limiter;

    let tasks = items.into_iter().map(|item| {
        let future = operation(item);
        async move {
            // The limiter is local and never closed, so a permit is always granted.
            let _permit = limiter.acquire().await.ok();
            future.await
        }
    });

    join_all(tasks).await.into_iter().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Items per batch
    pub batch_size: usize,
    /// Batches in flight at once
    pub concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Splits `items` into fixed-size batches and processes them through
/// [`parallel_limit`].
///
/// `on_batch_complete` sees the results of every batch that succeeds, even
/// when another batch fails and the overall call returns an error.
pub async fn batch_process<T, R, E, F, Fut, C>(
    items: Vec<T>,
    options: BatchOptions,
    operation: F,
    on_batch_complete: C,
) -> Result<Vec<R>, E>
where
    F: Fn(Vec<T>, usize) -> Fut,
    Fut: Future<Output = Result<Vec<R>, E>>,
    C: Fn(usize, &[R]),
{
    let batches = into_batches(items, options.batch_size);
    debug!(
        "Processing {} batch(es) of up to {} item(s), {} at a time",
        batches.len(),
        options.batch_size.max(1),
        options.concurrency.max(1)
    );

    let operation = &operation;
    let on_batch_complete = &on_batch_complete;

    let results = parallel_limit(
        batches.into_iter().enumerate(),
        options.concurrency,
        move |(index, batch)| async move {
            let results = operation(batch, index).await?;
            on_batch_complete(index, &results);
            Ok::<_, E>(results)
        },
    )
    .await?;

    Ok(results.into_iter().flatten().collect())
}

fn into_batches<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    mod limiter {
        use super::*;

        #[tokio::test]
        async fn permits_are_released_on_drop() {
            let limiter = ConcurrencyLimiter::new(2);
            let first = limiter.acquire().await.unwrap();
            let _second = limiter.acquire().await.unwrap();
            assert_eq!(limiter.available(), 0);
            assert_eq!(limiter.in_flight(), 2);

            drop(first);
            assert_eq!(limiter.available(), 1);
        }

        #[tokio::test]
        async fn closed_limiter_rejects_acquire() {
            let limiter = ConcurrencyLimiter::new(1);
            limiter.close();
            assert!(limiter.acquire().await.is_err());
        }

        #[test]
        fn zero_limit_is_treated_as_one() {
            assert_eq!(ConcurrencyLimiter::new(0).limit(), 1);
        }
    }

    mod parallel_limit {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn never_exceeds_the_limit() {
            let gauge = Gauge::new();
            let gauge = &gauge;

            let results = parallel_limit(0..10u64, 3, move |i| {
                async move {
                    gauge.enter();
                    tokio::time::sleep(Duration::from_millis(10 + (i % 4) * 5)).await;
                    gauge.exit();
                    Ok::<_, String>(i * 2)
                }
            })
            .await
            .unwrap();

            assert_eq!(results, (0..10u64).map(|i| i * 2).collect::<Vec<_>>());
            assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn fails_but_lets_dispatched_items_finish() {
            let finished = AtomicUsize::new(0);
            let counter = &finished;

            let result = parallel_limit(0..6, 2, move |i| {
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    if i == 1 {
                        Err(format!("item {i} failed"))
                    } else {
                        Ok(i)
                    }
                }
            })
            .await;

            assert_eq!(result, Err("item 1 failed".to_string()));
            assert_eq!(finished.load(Ordering::SeqCst), 6);
        }

        #[tokio::test]
        async fn handles_empty_input() {
            let result = parallel_limit(Vec::<u32>::new(), 4, |i| async move { Ok::<_, ()>(i) }).await;
            assert_eq!(result, Ok(vec![]));
        }
    }

    mod batch_process {
        use super::*;

        #[test]
        fn splits_into_fixed_size_batches() {
            let batches = into_batches((1..=7).collect(), 3);
            assert_eq!(batches, vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        }

        #[tokio::test]
        async fn flattens_results_in_order() {
            let options = BatchOptions {
                batch_size: 2,
                concurrency: 2,
            };

            let results = batch_process(
                (1..=5).collect(),
                options,
                |batch: Vec<i32>, _| async move { Ok::<_, String>(batch.iter().map(|i| i * 10).collect()) },
                |_, _| {},
            )
            .await
            .unwrap();

            assert_eq!(results, vec![10, 20, 30, 40, 50]);
        }

        #[tokio::test(start_paused = true)]
        async fn reports_completed_batches_even_when_one_fails() {
            let completed = Mutex::new(Vec::new());
            let options = BatchOptions {
                batch_size: 2,
                concurrency: 1,
            };

            let result = batch_process(
                (1..=6).collect(),
                options,
                |batch: Vec<i32>, index| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if index == 1 {
                        Err(format!("batch {index} rejected"))
                    } else {
                        Ok(batch)
                    }
                },
                |index, results: &[i32]| completed.lock().unwrap().push((index, results.to_vec())),
            )
            .await;

            assert_eq!(result, Err("batch 1 rejected".to_string()));
            let mut completed = completed.into_inner().unwrap();
            completed.sort();
            assert_eq!(completed, vec![(0, vec![1, 2]), (2, vec![5, 6])]);
        }
    }
}
