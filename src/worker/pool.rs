//! Worker pool — a fixed set of workers with collective shutdown.

use futures::future::join_all;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::transfer::{Transfer, TransferMode};
use crate::worker::state::WorkerStats;
use crate::worker::{JobFuture, JobId, Worker};

/// Owns a set of workers.
///
/// The pool imposes no placement policy: callers pick the worker a job runs
/// on.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Start `config.size` workers.
    ///
    /// If any worker fails to spawn, the ones already started are dropped
    /// (their threads exit) and the error is returned.
    pub fn start(config: &PoolConfig) -> Result<Self> {
        let workers = (0..config.size)
            .map(|index| Worker::start(config.worker_config(index)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(workers = workers.len(), "Worker pool started");
        Ok(Self { workers })
    }

    /// Build a pool from already started workers.
    pub fn from_workers(workers: Vec<Worker>) -> Self {
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker(&self, index: usize) -> Option<&Worker> {
        self.workers.get(index)
    }

    /// Schedule a job on the worker at `index`.
    ///
    /// An out-of-range index yields a failed future.
    pub fn schedule_on<T, R, P, F>(
        &self,
        index: usize,
        mode: TransferMode,
        producer: P,
        body: F,
    ) -> JobFuture<R>
    where
        T: Transfer,
        R: Send + 'static,
        P: FnOnce() -> T,
        F: FnOnce(T) -> R + Send + 'static,
    {
        match self.workers.get(index) {
            Some(worker) => worker.schedule(mode, producer, body),
            None => JobFuture::failed(
                JobId::new(),
                None,
                Error::NoSuchWorker {
                    index,
                    len: self.workers.len(),
                },
            ),
        }
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(Worker::stats).collect()
    }

    /// Terminate every worker and wait until all have exited.
    ///
    /// Termination is requested on all workers before waiting on any of
    /// them. Failures are collected into [`Error::Termination`] rather than
    /// stopping at the first one. Workers that were already terminating are
    /// waited on without a new request.
    pub async fn terminate_all(&self) -> Result<()> {
        let requests: Vec<(&Worker, Option<JobFuture<()>>)> = self
            .workers
            .iter()
            .map(|worker| {
                let request = worker
                    .state()
                    .is_accepting()
                    .then(|| worker.request_termination());
                (worker, request)
            })
            .collect();

        let outcomes = join_all(requests.iter().map(|(worker, request)| async move {
            if let Some(request) = request {
                request.result().await?;
            }
            worker.wait_terminated().await;
            Ok::<(), Error>(())
        }))
        .await;

        let failures: Vec<Error> = outcomes.into_iter().filter_map(|r| r.err()).collect();
        if failures.is_empty() {
            tracing::info!(workers = self.workers.len(), "Worker pool terminated");
            Ok(())
        } else {
            for failure in &failures {
                tracing::warn!(error = %failure, "Worker failed to terminate cleanly");
            }
            Err(Error::Termination { failures })
        }
    }
}

impl std::ops::Index<usize> for WorkerPool {
    type Output = Worker;

    fn index(&self, index: usize) -> &Worker {
        &self.workers[index]
    }
}
