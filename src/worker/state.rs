//! Worker and future state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Thread spawned, receive loop not entered yet.
    Created,
    /// Accepting and executing jobs.
    Running,
    /// Termination requested; queued jobs are draining.
    Terminating,
    /// The thread has exited. Final.
    Terminated,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Created, Running) | (Created, Terminating) | (Created, Terminated) |
            (Running, Terminating) | (Running, Terminated) |
            (Terminating, Terminated)
        )
    }

    /// Whether new jobs may be scheduled.
    pub fn is_accepting(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}

/// State of a job future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureState {
    /// The job has not finished.
    Pending,
    /// The job produced a value that has not been consumed.
    Ready,
    /// The job failed; the error has not been consumed.
    Failed,
    /// The outcome was handed to the caller.
    Consumed,
}

impl FutureState {
    /// Ready or Failed.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl std::fmt::Display for FutureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Consumed => "consumed",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time counters for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub name: String,
    pub state: WorkerState,
    /// Jobs accepted onto the queue.
    pub scheduled: u64,
    /// Jobs whose body returned a value.
    pub completed: u64,
    /// Jobs whose body returned an error or panicked.
    pub failed: u64,
    pub started_at: DateTime<Utc>,
}

impl WorkerStats {
    /// Jobs accepted but not finished yet.
    pub fn outstanding(&self) -> u64 {
        self.scheduled.saturating_sub(self.completed + self.failed)
    }
}
