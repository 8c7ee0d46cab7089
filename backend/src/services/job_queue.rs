//! Bounded-concurrency helpers shared by the backup and restore pipelines.
//!
//! These are the generic semaphore-gated primitives; components that also
//! need priority ordering (the search scheduler) layer a heap + `Notify` on
//! top of the same idiom rather than reusing this module directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error};

/// Ad-hoc bounded parallel operations without a full work queue.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    name: String,
}

impl ConcurrencyLimiter {
    pub fn new(name: &str, max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            name: name.to_string(),
        }
    }

    pub async fn run<F, Fut, T>(&self, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");
        debug!(limiter = %self.name, "acquired concurrency permit");
        let result = operation().await;
        debug!(limiter = %self.name, "released concurrency permit");
        result
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Process items in bounded chunks, waiting for each chunk before starting the next.
pub async fn process_in_chunks<T, F, Fut, R>(
    items: Vec<T>,
    chunk_size: usize,
    max_concurrent: usize,
    chunk_delay: Duration,
    processor: F,
) -> Vec<R>
where
    T: Send + Clone + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = R> + Send,
    R: Send + 'static,
{
    let mut all_results = Vec::with_capacity(items.len());
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    for chunk in items
        .chunks(chunk_size.max(1))
        .map(|c| c.to_vec())
        .collect::<Vec<_>>()
    {
        let mut handles = Vec::with_capacity(chunk.len());

        for item in chunk {
            let sem = semaphore.clone();
            let proc = processor.clone();

            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                proc(item).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(result) => all_results.push(result),
                Err(e) => {
                    error!(error = %e, "task panicked during chunk processing");
                }
            }
        }

        if chunk_delay > Duration::ZERO {
            tokio::time::sleep(chunk_delay).await;
        }
    }

    all_results
}

/// Process items with bounded concurrency using a buffered stream. More
/// memory-efficient than chunks for large datasets.
pub async fn process_concurrent<T, F, Fut, R>(
    items: impl IntoIterator<Item = T>,
    max_concurrent: usize,
    processor: F,
) -> Vec<R>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = R> + Send,
    R: Send + 'static,
{
    use futures::stream::{self, StreamExt};

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    stream::iter(items)
        .map(|item| {
            let sem = semaphore.clone();
            let proc = processor.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                proc(item).await
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await
}
