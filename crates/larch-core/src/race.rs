//! First-match fan-out.
//!
//! Runs a set of lookups concurrently and resolves with the first one
//! that produces a value, cancelling the stragglers. Used by directory
//! name resolution, where every member of a static-set is probed at once.

use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Run all futures concurrently, returning the first `Some` produced and
/// cancelling everything still in flight. Returns `None` once every
/// future has completed without a match.
pub async fn first_match<T, F>(futures: impl IntoIterator<Item = F>) -> Option<T>
where
    T: Send + 'static,
    F: Future<Output = Option<T>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let mut set = JoinSet::new();
    for fut in futures {
        let cancel = cancel.clone();
        set.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                found = fut => found,
            }
        });
    }

    while let Some(joined) = set.join_next().await {
        if let Ok(Some(found)) = joined {
            cancel.cancel();
            // Dropping the JoinSet aborts anything still running.
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn returns_first_hit() {
        let futs = (0..8u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(5 * i)).await;
            (i == 2).then_some(i)
        });
        assert_eq!(first_match(futs).await, Some(2));
    }

    #[tokio::test]
    async fn none_when_no_future_matches() {
        let futs = (0..4u64).map(|i| async move {
            tokio::time::sleep(Duration::from_millis(i)).await;
            None::<u64>
        });
        assert_eq!(first_match(futs).await, None);
    }

    #[tokio::test]
    async fn empty_input_is_none() {
        let futs: Vec<std::future::Ready<Option<u32>>> = Vec::new();
        assert_eq!(first_match(futs).await, None);
    }

    #[tokio::test]
    async fn stragglers_are_cancelled() {
        let finished = Arc::new(AtomicUsize::new(0));
        let futs: Vec<_> = (0..4u64)
            .map(|i| {
                let finished = finished.clone();
                async move {
                    if i == 0 {
                        return Some(i);
                    }
                    // Would run long past the winner without cancellation.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Some(i)
                }
            })
            .collect();
        assert_eq!(first_match(futs).await, Some(0));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
