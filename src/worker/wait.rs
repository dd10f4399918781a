//! Bounded-time waiting on many futures at once.

use std::future::Future;
use std::time::Duration;

use futures::future::select_all;

use crate::worker::JobFuture;

/// Return the futures that are ready within `budget`.
///
/// Returns as soon as at least one candidate is ready, or after `budget`
/// with an empty result. A zero budget is a single non-blocking poll, and an
/// empty candidate set returns immediately. Futures that were consumed, or
/// returned by an earlier call, are never returned again. The result keeps
/// the input order.
pub async fn wait_for_multiple_futures<R>(
    futures: &[JobFuture<R>],
    budget: Duration,
) -> Vec<&JobFuture<R>> {
    let candidates: Vec<&JobFuture<R>> = futures.iter().filter(|f| f.is_waitable()).collect();
    if candidates.is_empty() {
        return Vec::new();
    }

    if !budget.is_zero() && !candidates.iter().any(|f| f.is_ready()) {
        let signals = candidates.iter().map(|f| {
            let mut ready = f.ready_signal();
            Box::pin(async move {
                let _ = ready.wait_for(|ready| *ready).await;
            })
        });
        // timing out just means nothing became ready
        let _ = tokio::time::timeout(budget, select_all(signals)).await;
    }

    let drained: Vec<&JobFuture<R>> = candidates
        .into_iter()
        .filter(|f| f.is_ready() && f.mark_drained())
        .collect();
    tracing::trace!(ready = drained.len(), ?budget, "Multi-wait returned");
    drained
}

/// Method form of [`wait_for_multiple_futures`] for future collections.
pub trait WaitForMultiple<R> {
    fn wait_for_multiple<'a>(
        &'a self,
        budget: Duration,
    ) -> impl Future<Output = Vec<&'a JobFuture<R>>>
    where
        R: 'a;
}

impl<R> WaitForMultiple<R> for [JobFuture<R>] {
    fn wait_for_multiple<'a>(
        &'a self,
        budget: Duration,
    ) -> impl Future<Output = Vec<&'a JobFuture<R>>>
    where
        R: 'a,
    {
        wait_for_multiple_futures(self, budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::config::WorkerConfig;
    use crate::transfer::TransferMode;
    use crate::worker::Worker;

    fn sleeper(worker: &Worker, ms: u64) -> JobFuture<u64> {
        worker.schedule(TransferMode::Checked, move || ms, |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            ms
        })
    }

    #[tokio::test]
    async fn empty_set_returns_immediately() {
        let futures: Vec<JobFuture<u8>> = Vec::new();
        let started = Instant::now();
        assert!(futures.wait_for_multiple(Duration::from_secs(5)).await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn returns_within_budget_when_nothing_is_ready() {
        let worker = Worker::start(WorkerConfig::default()).unwrap();
        let futures = vec![sleeper(&worker, 500)];

        let started = Instant::now();
        let ready = wait_for_multiple_futures(&futures, Duration::from_millis(50)).await;
        let elapsed = started.elapsed();

        assert!(ready.is_empty());
        assert!(elapsed >= Duration::from_millis(45), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "overran budget: {elapsed:?}");
    }

    #[tokio::test]
    async fn zero_budget_is_a_single_poll() {
        let worker = Worker::start(WorkerConfig::default()).unwrap();
        let slow = sleeper(&worker, 300);
        let futures = vec![slow];

        let started = Instant::now();
        assert!(futures.wait_for_multiple(Duration::ZERO).await.is_empty());
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wakes_as_soon_as_one_is_ready() {
        let a = Worker::start(WorkerConfig::default()).unwrap();
        let b = Worker::start(WorkerConfig::default()).unwrap();
        let futures = vec![sleeper(&a, 2_000), sleeper(&b, 20)];

        let started = Instant::now();
        let ready = futures.wait_for_multiple(Duration::from_secs(1)).await;

        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id(), futures[1].id());
    }

    #[tokio::test]
    async fn drained_futures_never_reappear() {
        let worker = Worker::start(WorkerConfig::default()).unwrap();
        let futures = vec![sleeper(&worker, 0), sleeper(&worker, 0)];
        for f in &futures {
            f.result().await.ok();
        }
        let fresh = vec![sleeper(&worker, 0)];

        // consumed futures are skipped
        assert!(futures.wait_for_multiple(Duration::ZERO).await.is_empty());

        let first = fresh.wait_for_multiple(Duration::from_secs(1)).await;
        assert_eq!(first.len(), 1);
        // returned but not consumed: still not returned again
        let second = fresh.wait_for_multiple(Duration::from_millis(20)).await;
        assert!(second.is_empty());
        assert_eq!(fresh[0].result().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn result_is_subset_in_input_order() {
        let worker = Worker::start(WorkerConfig::default()).unwrap();
        let futures: Vec<_> = (0..5).map(|_| sleeper(&worker, 0)).collect();
        futures.last().unwrap().result().await.ok();
        // everything before the last job has finished too (FIFO)
        let ready = futures.wait_for_multiple(Duration::from_millis(10)).await;

        let ids: Vec<_> = ready.iter().map(|f| f.id()).collect();
        let expected: Vec<_> = futures[..4].iter().map(|f| f.id()).collect();
        assert_eq!(ids, expected);
    }
}
