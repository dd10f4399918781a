//! Worker system — isolated execution contexts and their futures.
//!
//! Core components:
//! - `id` — Worker and job identifiers
//! - `state` — Worker lifecycle (Created → Running → Terminating → Terminated) and future states
//! - `future` — JobFuture: blocking/async consume, non-blocking poll
//! - `worker` — Worker thread with a FIFO job queue
//! - `wait` — Bounded-time wait over many futures
//! - `pool` — WorkerPool with collective termination

pub mod future;
pub mod id;
pub mod pool;
pub mod state;
pub mod wait;
pub mod worker;

pub use future::JobFuture;
pub use id::{JobId, WorkerId};
pub use pool::WorkerPool;
pub use state::{FutureState, WorkerState, WorkerStats};
pub use wait::{WaitForMultiple, wait_for_multiple_futures};
pub use worker::Worker;
