//! Job futures.
//!
//! A [`JobFuture`] is the caller's half of a one-shot result slot; the worker
//! holds the other half (a [`Promise`]) only until it delivers the outcome.
//! Readiness is signalled through a `watch` channel, which is the single
//! primitive behind async `consume`, blocking `consume_blocking` and the
//! bounded-time multi-wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::{Error, JobError, Result};
use crate::worker::state::FutureState;
use crate::worker::{JobId, WorkerId};

enum Slot<R> {
    Pending,
    Done(Result<R>),
    Taken,
}

struct Completion<R> {
    slot: Mutex<Slot<R>>,
    ready: watch::Sender<bool>,
}

impl<R> Completion<R> {
    fn new(slot: Slot<R>) -> Arc<Self> {
        let ready = matches!(slot, Slot::Done(_));
        let (tx, _rx) = watch::channel(ready);
        Arc::new(Self {
            slot: Mutex::new(slot),
            ready: tx,
        })
    }

    fn slot(&self) -> MutexGuard<'_, Slot<R>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, outcome: Result<R>) {
        {
            let mut slot = self.slot();
            if matches!(*slot, Slot::Pending) {
                *slot = Slot::Done(outcome);
            }
        }
        self.ready.send_replace(true);
    }
}

/// Create a linked promise/future pair for one job.
pub(crate) fn pair<R>(job: JobId, worker: WorkerId) -> (Promise<R>, JobFuture<R>) {
    let completion = Completion::new(Slot::Pending);
    let promise = Promise {
        job,
        worker,
        completion: Some(Arc::clone(&completion)),
    };
    (promise, JobFuture::new(job, Some(worker), completion))
}

/// Worker-side half of a job future.
///
/// Dropping a promise without completing it resolves the future as
/// [`JobError::Lost`].
pub(crate) struct Promise<R> {
    job: JobId,
    worker: WorkerId,
    completion: Option<Arc<Completion<R>>>,
}

impl<R> Promise<R> {
    pub(crate) fn complete(mut self, outcome: Result<R>) {
        if let Some(completion) = self.completion.take() {
            completion.resolve(outcome);
        }
    }
}

impl<R> Drop for Promise<R> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::warn!(job = %self.job, worker = %self.worker, "Job dropped without a result");
            completion.resolve(Err(JobError::Lost {
                id: self.job,
                worker: self.worker,
            }
            .into()));
        }
    }
}

/// Caller-owned handle to the eventual result of one job.
pub struct JobFuture<R> {
    id: JobId,
    worker: Option<WorkerId>,
    completion: Arc<Completion<R>>,
    drained: AtomicBool,
}

impl<R> JobFuture<R> {
    fn new(id: JobId, worker: Option<WorkerId>, completion: Arc<Completion<R>>) -> Self {
        Self {
            id,
            worker,
            completion,
            drained: AtomicBool::new(false),
        }
    }

    /// A future that is already `Failed`. `worker` is `None` when the job
    /// was never placed on one.
    pub(crate) fn failed(id: JobId, worker: Option<WorkerId>, error: Error) -> Self {
        Self::new(id, worker, Completion::new(Slot::Done(Err(error))))
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// The worker the job was scheduled on, or `None` if it never reached
    /// one (for example an out-of-range pool index).
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker
    }

    pub fn state(&self) -> FutureState {
        match &*self.completion.slot() {
            Slot::Pending => FutureState::Pending,
            Slot::Done(Ok(_)) => FutureState::Ready,
            Slot::Done(Err(_)) => FutureState::Failed,
            Slot::Taken => FutureState::Consumed,
        }
    }

    /// True iff the job has finished and its outcome has not been consumed.
    pub fn is_ready(&self) -> bool {
        self.state().is_resolved()
    }

    /// Wait until the job has an outcome.
    async fn resolved(&self) {
        let mut ready = self.completion.ready.subscribe();
        // the sender lives in `completion`, so this only ends once ready
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// Wait for the outcome and hand a value to `on_result`.
    ///
    /// A failed job returns its error instead. Either way the future is
    /// `Consumed` afterwards and a second call fails with
    /// [`Error::AlreadyConsumed`].
    pub async fn consume<T>(&self, on_result: impl FnOnce(R) -> T) -> Result<T> {
        if matches!(self.state(), FutureState::Consumed) {
            return Err(Error::AlreadyConsumed { job: self.id });
        }

        self.resolved().await;

        let outcome = std::mem::replace(&mut *self.completion.slot(), Slot::Taken);
        match outcome {
            Slot::Done(outcome) => outcome.map(on_result),
            Slot::Taken => Err(Error::AlreadyConsumed { job: self.id }),
            // `resolve` stores the outcome before raising the signal
            Slot::Pending => unreachable!("job {} signalled ready without an outcome", self.id),
        }
    }

    /// Wait for and take the job's result.
    pub async fn result(&self) -> Result<R> {
        self.consume(|value| value).await
    }

    /// [`consume`](Self::consume) for callers outside an async context.
    ///
    /// Blocks the calling thread. Must not be called from inside an async
    /// runtime worker thread.
    pub fn consume_blocking<T>(&self, on_result: impl FnOnce(R) -> T) -> Result<T> {
        futures::executor::block_on(self.consume(on_result))
    }

    /// Mark the future as returned by a multi-wait. Returns false if it
    /// already was.
    pub(crate) fn mark_drained(&self) -> bool {
        !self.drained.swap(true, Ordering::AcqRel)
    }

    /// Neither consumed nor returned by an earlier multi-wait.
    pub(crate) fn is_waitable(&self) -> bool {
        !self.drained.load(Ordering::Acquire) && self.state() != FutureState::Consumed
    }

    pub(crate) fn ready_signal(&self) -> watch::Receiver<bool> {
        self.completion.ready.subscribe()
    }
}

impl<R: Clone> JobFuture<R> {
    /// Report the current outcome without waiting or consuming it.
    ///
    /// `None` while the job is pending. Repeatable: the state never changes
    /// as a result of polling. After consumption reports
    /// [`Error::AlreadyConsumed`].
    pub fn poll(&self) -> Option<Result<R>> {
        match &*self.completion.slot() {
            Slot::Pending => None,
            Slot::Done(outcome) => Some(outcome.clone()),
            Slot::Taken => Some(Err(Error::AlreadyConsumed { job: self.id })),
        }
    }
}

impl<R> std::fmt::Debug for JobFuture<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFuture")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids() -> (JobId, WorkerId) {
        (JobId::new(), WorkerId::new())
    }

    #[tokio::test]
    async fn consume_delivers_value_once() {
        let (job, worker) = ids();
        let (promise, future) = pair::<u32>(job, worker);
        promise.complete(Ok(37564));

        assert_eq!(future.state(), FutureState::Ready);
        let doubled = future.consume(|v| v * 2).await.unwrap();
        assert_eq!(doubled, 75128);
        assert_eq!(future.state(), FutureState::Consumed);

        let again = future.consume(|v| v).await;
        assert!(matches!(again, Err(Error::AlreadyConsumed { job: j }) if j == job));
    }

    #[tokio::test]
    async fn consume_waits_for_completion() {
        let (job, worker) = ids();
        let (promise, future) = pair::<String>(job, worker);

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            promise.complete(Ok("done".to_string()));
        });

        assert!(!future.is_ready());
        assert_eq!(future.result().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn failed_outcome_is_surfaced() {
        let (job, worker) = ids();
        let (promise, future) = pair::<u32>(job, worker);
        promise.complete(Err(JobError::Failed {
            id: job,
            reason: "boom".to_string(),
        }
        .into()));

        assert_eq!(future.state(), FutureState::Failed);
        assert!(future.is_ready());
        let err = future.result().await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Failed { .. })));
        assert_eq!(future.state(), FutureState::Consumed);
    }

    #[test]
    fn poll_is_repeatable() {
        let (job, worker) = ids();
        let (promise, future) = pair::<u8>(job, worker);

        assert!(future.poll().is_none());
        assert!(future.poll().is_none());
        assert_eq!(future.state(), FutureState::Pending);

        promise.complete(Ok(7));
        assert_eq!(future.poll().unwrap().unwrap(), 7);
        assert_eq!(future.poll().unwrap().unwrap(), 7);
        assert_eq!(future.state(), FutureState::Ready);
    }

    #[test]
    fn poll_after_consume_reports_consumed() {
        let (job, worker) = ids();
        let (promise, future) = pair::<u8>(job, worker);
        promise.complete(Ok(1));

        future.consume_blocking(|_| ()).unwrap();
        assert!(matches!(
            future.poll(),
            Some(Err(Error::AlreadyConsumed { .. }))
        ));
    }

    #[test]
    fn dropped_promise_resolves_as_lost() {
        let (job, worker) = ids();
        let (promise, future) = pair::<u8>(job, worker);
        drop(promise);

        let err = future.consume_blocking(|v| v).unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Lost { .. })));
    }

    #[test]
    fn prefailed_future_is_ready_immediately() {
        let (job, worker) = ids();
        let future = JobFuture::<u8>::failed(
            job,
            Some(worker),
            Error::AlreadyConsumed { job },
        );
        assert_eq!(future.state(), FutureState::Failed);
        assert_eq!(future.worker_id(), Some(worker));
        assert!(*future.ready_signal().borrow());
    }

    #[test]
    fn drained_only_once() {
        let (job, worker) = ids();
        let (_promise, future) = pair::<u8>(job, worker);
        assert!(future.is_waitable());
        assert!(future.mark_drained());
        assert!(!future.mark_drained());
        assert!(!future.is_waitable());
    }
}
