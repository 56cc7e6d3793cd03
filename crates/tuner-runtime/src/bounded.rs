use std::future::Future;

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("concurrency limit must be > 0")]
    InvalidLimit,
}

/// Runs `worker` over `items` with at most `limit` futures in flight.
///
/// Items start in input order; the next one starts as soon as any in-flight worker
/// settles. A failing worker does not cancel its siblings. The returned outcomes are
/// indexed by input position and the call only returns once every started worker
/// has settled. A panicking worker is re-raised on the caller.
pub async fn run_with_concurrency<T, O, F, Fut>(
    items: Vec<T>,
    limit: usize,
    mut worker: F,
) -> Result<Vec<anyhow::Result<O>>, ConcurrencyError>
where
    F: FnMut(T, usize) -> Fut,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    O: Send + 'static,
{
    if limit == 0 {
        return Err(ConcurrencyError::InvalidLimit);
    }

    let total = items.len();
    debug!(items = total as u64, limit = limit as u64, "bounded run start");

    let mut slots: Vec<Option<anyhow::Result<O>>> = (0..total).map(|_| None).collect();
    let mut queue = items.into_iter().enumerate();
    let mut joinset = JoinSet::new();

    loop {
        while joinset.len() < limit {
            let Some((index, item)) = queue.next() else {
                break;
            };
            let fut = worker(item, index);
            joinset.spawn(async move { (index, fut.await) });
        }

        let Some(res) = joinset.join_next().await else {
            break;
        };
        match res {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => debug!(error = %err, "bounded worker cancelled"),
        }
    }

    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| Err(anyhow::anyhow!("worker {index} was cancelled")))
        })
        .collect())
}
