//! Bounded fan-out/fan-in helpers.
//!
//! Futures run cooperatively on the calling task with at most `limit` in
//! flight; blocking functions are offloaded to the tokio blocking pool. Every
//! helper returns results in input order.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;

use crate::error::{Result, TetherError};

/// Run every operation with at most `limit` in flight and wait for all of them.
///
/// A failed operation's slot holds its error; the others still run to
/// completion. A `limit` of zero is treated as one.
pub async fn run_bounded<I, Fut, T, E>(ops: I, limit: usize) -> Vec<std::result::Result<T, E>>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    stream::iter(ops).buffered(limit.max(1)).collect().await
}

/// Fail-fast variant of [`run_bounded`]: the first error is returned and the
/// operations still pending are dropped.
pub async fn try_run_bounded<I, Fut, T, E>(ops: I, limit: usize) -> std::result::Result<Vec<T>, E>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    stream::iter(ops).buffered(limit.max(1)).try_collect().await
}

/// Like [`run_bounded`], keeping each operation's name next to its result.
pub async fn run_named<I, Fut, T, E>(
    ops: I,
    limit: usize,
) -> Vec<(String, std::result::Result<T, E>)>
where
    I: IntoIterator<Item = (String, Fut)>,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    stream::iter(ops)
        .map(|(name, op)| async move { (name, op.await) })
        .buffered(limit.max(1))
        .collect()
        .await
}

/// Call a blocking function once per item on the blocking thread pool, with at
/// most `limit` calls running at once.
///
/// A call that panics yields `TetherError::Handler` in its slot.
pub async fn run_blocking_bounded<F, A, T>(
    func: F,
    items: Vec<A>,
    limit: usize,
) -> Result<Vec<Result<T>>>
where
    F: Fn(A) -> T + Send + Sync + 'static,
    A: Send + 'static,
    T: Send + 'static,
{
    if limit == 0 {
        return Err(TetherError::InvalidInput(
            "concurrency limit must be at least 1".to_string(),
        ));
    }

    let func = Arc::new(func);
    let results = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let func = func.clone();
            async move {
                tokio::task::spawn_blocking(move || func(item))
                    .await
                    .map_err(|e| {
                        tracing::error!(index, error = %e, "Blocking task failed");
                        TetherError::Handler(format!("blocking task {index} failed: {e}"))
                    })
            }
        })
        .buffered(limit)
        .collect()
        .await;

    Ok(results)
}
