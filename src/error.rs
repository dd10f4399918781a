//! Error types for isoworker.

use crate::worker::state::WorkerState;
use crate::worker::{JobId, WorkerId};

/// Top-level error type.
///
/// Every variant is `Clone` so that a failed job outcome can be reported
/// more than once (see [`JobFuture::poll`](crate::worker::JobFuture::poll)).
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Worker {worker} is {state} and does not accept jobs")]
    WorkerUnavailable { worker: WorkerId, state: WorkerState },

    #[error("Result of job {job} was already consumed")]
    AlreadyConsumed { job: JobId },

    #[error("Failed to spawn worker thread {name}: {reason}")]
    Spawn { name: String, reason: String },

    #[error("Worker index {index} out of range (pool has {len} workers)")]
    NoSuchWorker { index: usize, len: usize },

    #[error("{} worker(s) failed to terminate cleanly", .failures.len())]
    Termination { failures: Vec<Error> },
}

/// Configuration-related errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while moving a value across the isolation boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error(
        "Value of type {type_name} is still referenced outside the transferred graph \
         ({strong} strong references, {owned} owned by the graph)"
    )]
    UnownedReference {
        type_name: &'static str,
        strong: usize,
        owned: usize,
    },

    #[error("Value of type {type_name} is part of a reference cycle")]
    CyclicUnsupported { type_name: &'static str },
}

/// Failures raised inside a job body, or by its worker going away.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} failed: {reason}")]
    Failed { id: JobId, reason: String },

    #[error("Job {id} panicked: {message}")]
    Panicked { id: JobId, message: String },

    #[error("Job {id} was lost: worker {worker} exited without delivering a result")]
    Lost { id: JobId, worker: WorkerId },
}

/// Result type alias for isoworker.
pub type Result<T> = std::result::Result<T, Error>;
