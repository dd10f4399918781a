//! Isolated worker execution.
//!
//! Each worker owns a dedicated thread and a FIFO queue. Submission is
//! non-blocking: the caller runs the producer, validates the input through
//! the transfer policy, snapshots captured globals and enqueues. The thread
//! runs one job at a time with the job's snapshot installed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::captured::Snapshot;
use crate::config::WorkerConfig;
use crate::error::{Error, JobError, Result};
use crate::transfer::{self, Transfer, TransferMode};
use crate::worker::future::{self, JobFuture, Promise};
use crate::worker::state::{WorkerState, WorkerStats};
use crate::worker::{JobId, WorkerId};

/// A packaged job, run on the worker thread.
type RunJob = Box<dyn FnOnce(&WorkerShared) + Send>;

enum WorkerMessage {
    Job { id: JobId, run: RunJob },
    Terminate(Promise<()>),
}

/// State shared between the worker handle and its thread.
struct WorkerShared {
    id: WorkerId,
    name: String,
    state: watch::Sender<WorkerState>,
    scheduled: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    started_at: DateTime<Utc>,
}

impl WorkerShared {
    fn transition(&self, target: WorkerState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(target) {
                *state = target;
                true
            } else {
                false
            }
        })
    }
}

/// Marks the worker terminated when its thread leaves the receive loop,
/// including by unwinding.
struct ExitGuard(Arc<WorkerShared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.transition(WorkerState::Terminated);
        tracing::info!(worker = %self.0.id, name = %self.0.name, "Worker terminated");
    }
}

/// Handle to an isolated worker thread.
pub struct Worker {
    shared: Arc<WorkerShared>,
    /// `None` once termination has been requested.
    queue: Mutex<Option<mpsc::UnboundedSender<WorkerMessage>>>,
}

impl Worker {
    /// Spawn a worker thread.
    pub fn start(config: WorkerConfig) -> Result<Self> {
        let id = WorkerId::new();
        let name = config
            .name
            .unwrap_or_else(|| format!("worker-{}", id.short()));
        let (state, _) = watch::channel(WorkerState::Created);
        let shared = Arc::new(WorkerShared {
            id,
            name: name.clone(),
            state,
            scheduled: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started_at: Utc::now(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let mut builder = std::thread::Builder::new().name(name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let thread_shared = Arc::clone(&shared);
        builder
            .spawn(move || Self::run(thread_shared, rx))
            .map_err(|e| Error::Spawn {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(worker = %id, name = %name, "Worker started");

        Ok(Self {
            shared,
            queue: Mutex::new(Some(tx)),
        })
    }

    /// Receive loop, executed on the worker thread.
    fn run(shared: Arc<WorkerShared>, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        let guard = ExitGuard(Arc::clone(&shared));
        shared.transition(WorkerState::Running);

        let mut termination = None;
        while let Some(message) = rx.blocking_recv() {
            match message {
                WorkerMessage::Job { id, run } => {
                    tracing::debug!(worker = %shared.id, job = %id, "Job started");
                    run(&shared);
                }
                WorkerMessage::Terminate(promise) => {
                    termination = Some(promise);
                    break;
                }
            }
        }

        drop(guard);
        if let Some(promise) = termination {
            promise.complete(Ok(()));
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.shared.id,
            name: self.shared.name.clone(),
            state: self.state(),
            scheduled: self.shared.scheduled.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            started_at: self.shared.started_at,
        }
    }

    fn queue(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<WorkerMessage>>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unavailable(&self) -> Error {
        Error::WorkerUnavailable {
            worker: self.shared.id,
            state: self.state(),
        }
    }

    /// Schedule `body(producer())` on this worker.
    ///
    /// Never blocks. Transfer failures and an unavailable worker come back
    /// as an already-failed future; nothing is queued in that case.
    pub fn schedule<T, R, P, F>(&self, mode: TransferMode, producer: P, body: F) -> JobFuture<R>
    where
        T: Transfer,
        R: Send + 'static,
        P: FnOnce() -> T,
        F: FnOnce(T) -> R + Send + 'static,
    {
        let job = JobId::new();
        self.submit(job, mode, producer, move |input| Ok(body(input)))
            .unwrap_or_else(|e| JobFuture::failed(job, Some(self.shared.id), e))
    }

    /// Like [`schedule`](Self::schedule), for bodies that can fail.
    ///
    /// An `Err` from the body resolves the future as [`JobError::Failed`].
    pub fn schedule_fallible<T, R, P, F>(
        &self,
        mode: TransferMode,
        producer: P,
        body: F,
    ) -> JobFuture<R>
    where
        T: Transfer,
        R: Send + 'static,
        P: FnOnce() -> T,
        F: FnOnce(T) -> anyhow::Result<R> + Send + 'static,
    {
        let job = JobId::new();
        self.submit(job, mode, producer, body)
            .unwrap_or_else(|e| JobFuture::failed(job, Some(self.shared.id), e))
    }

    /// Like [`schedule`](Self::schedule), but transfer and availability
    /// errors are returned instead of wrapped in a failed future.
    pub fn try_schedule<T, R, P, F>(
        &self,
        mode: TransferMode,
        producer: P,
        body: F,
    ) -> Result<JobFuture<R>>
    where
        T: Transfer,
        R: Send + 'static,
        P: FnOnce() -> T,
        F: FnOnce(T) -> R + Send + 'static,
    {
        self.submit(JobId::new(), mode, producer, move |input| Ok(body(input)))
    }

    fn submit<T, R, P, F>(
        &self,
        job: JobId,
        mode: TransferMode,
        producer: P,
        body: F,
    ) -> Result<JobFuture<R>>
    where
        T: Transfer,
        R: Send + 'static,
        P: FnOnce() -> T,
        F: FnOnce(T) -> anyhow::Result<R> + Send + 'static,
    {
        let worker = self.shared.id;

        let transferred = transfer::validate(producer(), mode).inspect_err(|e| {
            tracing::warn!(worker = %worker, job = %job, error = %e, "Job input rejected");
        })?;
        let kind = transferred.kind();
        let input = transferred.into_inner();

        let snapshot = Snapshot::capture().inspect_err(|e| {
            tracing::warn!(worker = %worker, job = %job, error = %e, "Captured state rejected");
        })?;
        let captured = snapshot.len();

        let (promise, future) = future::pair(job, worker);
        let run: RunJob = Box::new(move |shared: &WorkerShared| {
            execute(shared, job, snapshot, promise, move || body(input))
        });

        let queue = self.queue();
        let tx = match queue.as_ref() {
            Some(tx) if self.state().is_accepting() => tx,
            _ => return Err(self.unavailable()),
        };
        // a send error hands the message back; dropping it resolves the promise
        tx.send(WorkerMessage::Job { id: job, run })
            .map_err(|_| self.unavailable())?;
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        tracing::debug!(
            worker = %worker,
            job = %job,
            transfer = %kind,
            captured,
            "Job scheduled"
        );
        Ok(future)
    }

    /// Stop accepting jobs and let the queue drain.
    ///
    /// The returned future resolves once every job queued before this call
    /// has finished and the worker thread has exited. A worker that is
    /// already terminating or terminated yields a failed future.
    pub fn request_termination(&self) -> JobFuture<()> {
        let job = JobId::new();
        let mut queue = self.queue();

        let tx = match queue.take() {
            Some(tx) if self.state().is_accepting() => tx,
            other => {
                *queue = other;
                return JobFuture::failed(job, Some(self.shared.id), self.unavailable());
            }
        };
        self.shared.transition(WorkerState::Terminating);
        drop(queue);

        tracing::info!(worker = %self.shared.id, name = %self.shared.name, "Termination requested");

        let (promise, future) = future::pair(job, self.shared.id);
        // if the thread is already gone the returned message drops the promise
        let _ = tx.send(WorkerMessage::Terminate(promise));
        future
    }

    /// Wait until the worker thread has exited.
    pub async fn wait_terminated(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(WorkerState::is_terminal).await;
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Run one job on the worker thread and deliver its outcome.
fn execute<R>(
    shared: &WorkerShared,
    job: JobId,
    snapshot: Snapshot,
    promise: Promise<R>,
    body: impl FnOnce() -> anyhow::Result<R>,
) {
    let outcome = {
        let _scope = snapshot.enter();
        panic::catch_unwind(AssertUnwindSafe(body))
    };

    let outcome = match outcome {
        Ok(Ok(value)) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(worker = %shared.id, job = %job, "Job completed");
            Ok(value)
        }
        Ok(Err(e)) => {
            let reason = format!("{e:#}");
            shared.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker = %shared.id, job = %job, error = %reason, "Job failed");
            Err(JobError::Failed { id: job, reason })
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            shared.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(worker = %shared.id, job = %job, panic = %message, "Job panicked");
            Err(JobError::Panicked { id: job, message })
        }
    };

    promise.complete(outcome.map_err(Error::from));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::TransferError;
    use crate::worker::state::FutureState;

    fn start() -> Worker {
        Worker::start(WorkerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn schedule_and_consume() {
        let worker = start();
        let future = worker.schedule(TransferMode::Checked, || 18782, |input: i32| input + input);

        let result = future.consume(|v| v).await.unwrap();
        assert_eq!(result, 37564);
        assert_eq!(future.state(), FutureState::Consumed);

        worker.request_termination().result().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let worker = start();
        let order = Arc::new(Mutex::new(Vec::new()));

        let futures: Vec<_> = (0..20)
            .map(|i| {
                let order = Arc::clone(&order);
                worker.schedule(TransferMode::Checked, move || i, move |i: u32| {
                    order.lock().unwrap().push(i);
                    i
                })
            })
            .collect();

        for future in &futures {
            future.result().await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn transfer_failure_is_a_failed_future() {
        let worker = start();
        let shared = Arc::new(vec![1, 2, 3]);
        let kept = Arc::clone(&shared);

        let future = worker.schedule(TransferMode::Checked, move || shared, |v: Arc<Vec<i32>>| {
            v.len()
        });

        assert_eq!(future.state(), FutureState::Failed);
        let err = future.result().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::UnownedReference { .. })
        ));
        assert_eq!(worker.stats().scheduled, 0);
        drop(kept);
    }

    #[tokio::test]
    async fn try_schedule_reports_synchronously() {
        let worker = start();
        let shared = Arc::new(1u8);
        let _kept = Arc::clone(&shared);

        let err = worker
            .try_schedule(TransferMode::Checked, move || shared, |v: Arc<u8>| *v)
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(_)));
    }

    #[tokio::test]
    async fn unsafe_mode_accepts_shared_input() {
        let worker = start();
        let shared = Arc::new(5u32);
        let kept = Arc::clone(&shared);

        let future = worker.schedule(TransferMode::Unsafe, move || shared, |v: Arc<u32>| *v * 2);
        assert_eq!(future.result().await.unwrap(), 10);
        assert_eq!(*kept, 5);
    }

    #[tokio::test]
    async fn failing_job_does_not_affect_later_jobs() {
        let worker = start();

        let panicked = worker.schedule(TransferMode::Checked, || 0u32, |_: u32| -> u32 {
            panic!("kaboom")
        });
        let errored = worker.schedule_fallible(TransferMode::Checked, || 0u32, |_: u32| {
            anyhow::bail!("bad input")
        });
        let fine = worker.schedule(TransferMode::Checked, || 2u32, |v: u32| v + 1);

        let err = panicked.result().await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Panicked { ref message, .. }) if message == "kaboom"));

        let err: Error = errored.result().await.map(|_: u32| ()).unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Failed { ref reason, .. }) if reason == "bad input"));

        assert_eq!(fine.result().await.unwrap(), 3);

        let stats = worker.stats();
        assert_eq!(stats.scheduled, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn termination_drains_queue_then_rejects() {
        let worker = start();
        let slow = worker.schedule(TransferMode::Checked, || 30u64, |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            "slow"
        });

        let terminated = worker.request_termination();
        assert_eq!(worker.state(), WorkerState::Terminating);

        let rejected = worker.schedule(TransferMode::Checked, || 1u8, |v: u8| v);
        assert!(matches!(
            rejected.result().await,
            Err(Error::WorkerUnavailable { .. })
        ));

        terminated.result().await.unwrap();
        assert_eq!(slow.result().await.unwrap(), "slow");
        assert_eq!(worker.state(), WorkerState::Terminated);

        let again = worker.request_termination();
        assert!(matches!(
            again.result().await,
            Err(Error::WorkerUnavailable {
                state: WorkerState::Terminated,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn dropped_worker_drains_before_exit() {
        let worker = start();
        let future = worker.schedule(TransferMode::Checked, || 4u32, |v: u32| {
            std::thread::sleep(Duration::from_millis(20));
            v * v
        });
        drop(worker);

        assert_eq!(future.result().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn named_worker_thread() {
        let worker = Worker::start(WorkerConfig {
            name: Some("isolated-7".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(worker.name(), "isolated-7");

        let thread_name = worker
            .schedule(TransferMode::Checked, || (), |_: ()| {
                std::thread::current().name().map(str::to_string)
            })
            .result()
            .await
            .unwrap();
        assert_eq!(thread_name.as_deref(), Some("isolated-7"));
    }

    #[test]
    fn blocking_consume_from_plain_thread() {
        let worker = start();
        let future = worker.schedule(TransferMode::Checked, || 21u32, |v: u32| v * 2);

        let mut seen = None;
        future.consume_blocking(|v| seen = Some(v)).unwrap();
        assert_eq!(seen, Some(42));
        assert!(matches!(
            future.consume_blocking(|_| ()),
            Err(Error::AlreadyConsumed { .. })
        ));
    }

    #[test]
    fn panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&3u8), "non-string panic payload");
    }
}
