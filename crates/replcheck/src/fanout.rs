//! Map a per-replica task over the replica set with bounded concurrency.
//!
//! Every phase that touches replicas in parallel (role verification, read
//! dispatch, consistency checks, lag probes) goes through [`map_replicas`].
//! Each task writes only to its own pre-assigned slot; slots are merged after
//! all tasks finish, so no locking is needed for result collection.
//!
//! Tasks live in a [`JoinSet`]; if the caller's future is dropped (for
//! example on Ctrl-C) the remaining tasks are aborted and whatever
//! connections they own are released.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ReplicaId;
use crate::error::VerifyError;

/// Runs `task(replica, input)` for every input concurrently, at most
/// `max_parallel` at a time, and waits for all of them.
///
/// Returns exactly one entry per input, in input order. A task that panics
/// yields [`VerifyError::Task`] in its slot without affecting its siblings.
pub async fn map_replicas<I, T, F, Fut>(
    inputs: Vec<I>,
    max_parallel: usize,
    task: F,
) -> Vec<Result<T, VerifyError>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(ReplicaId, I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let slots_len = inputs.len();
    let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut set = JoinSet::new();

    for (idx, input) in inputs.into_iter().enumerate() {
        let fut = task(ReplicaId(idx), input);
        let permits = permits.clone();
        set.spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = permits.acquire_owned().await;
            (idx, fut.await)
        });
    }

    let mut slots: Vec<Option<T>> = (0..slots_len).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, value)) => slots[idx] = Some(value),
            Err(err) => tracing::warn!(error = %err, "replica task did not complete"),
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| {
            slot.ok_or_else(|| VerifyError::Task {
                replica: ReplicaId(idx).to_string(),
                detail: "task panicked or was cancelled".to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn results_keep_input_order() {
        let out = map_replicas(vec![30u64, 10, 20], 3, |replica, delay_ms| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            (replica, delay_ms)
        })
        .await;

        let values = out
            .into_iter()
            .map(|r| r.expect("task ok"))
            .collect::<Vec<_>>();
        assert_eq!(
            values,
            vec![(ReplicaId(0), 30), (ReplicaId(1), 10), (ReplicaId(2), 20)]
        );
    }

    #[tokio::test]
    async fn panicking_task_is_isolated() {
        let out = map_replicas(vec![0, 1, 2], 3, |_, n| async move {
            if n == 1 {
                panic!("boom");
            }
            n * 10
        })
        .await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].as_ref().ok(), Some(&0));
        assert!(matches!(out[1], Err(VerifyError::Task { .. })));
        assert_eq!(out[2].as_ref().ok(), Some(&20));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let out = map_replicas(vec![(); 6], 2, |_, ()| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(out.len(), 6);
        assert!(out.iter().all(Result::is_ok));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_input_returns_empty() {
        let out = map_replicas(Vec::<u8>::new(), 4, |_, v| async move { v }).await;
        assert!(out.is_empty());
    }
}
