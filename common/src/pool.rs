//! Worker pool draining a shared channel and merging per-worker summaries

use std::future::Future;

use anyhow::Context;

/// Runs `workers` tasks that take items off `items` until the channel is closed and drained.
///
/// Every worker folds the summaries `handle` returns into a local one; the locals are merged only
/// after all workers have been joined, so the result is final once this returns.
///
/// # Errors
///
/// Fails if a worker panicked.
pub async fn drain<T, S, F, Fut>(
    workers: usize,
    items: async_channel::Receiver<T>,
    handle: F,
) -> anyhow::Result<S>
where
    T: Send + 'static,
    S: Default + std::ops::Add<Output = S> + Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = S> + Send + 'static,
{
    let mut join_set = tokio::task::JoinSet::new();
    for worker in 0..workers.max(1) {
        let items = items.clone();
        let handle = handle.clone();
        join_set.spawn(async move {
            let mut summary = S::default();
            while let Ok(item) = items.recv().await {
                summary = summary + handle(item).await;
            }
            tracing::trace!("worker {} done", worker);
            summary
        });
    }
    // only the workers keep the channel open from here on
    drop(items);
    let mut summary = S::default();
    while let Some(res) = join_set.join_next().await {
        summary = summary + res.context("worker task failed")?;
    }
    Ok(summary)
}
