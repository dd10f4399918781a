//! isoworker — isolated worker threads with ownership-checked job transfer.
//!
//! ```no_run
//! use isoworker::{TransferMode, Worker, WorkerConfig};
//!
//! # async fn demo() -> isoworker::error::Result<()> {
//! let worker = Worker::start(WorkerConfig::default())?;
//! let future = worker.schedule(TransferMode::Checked, || 18782, |input: i32| input + input);
//! future.consume(|sum| println!("sum = {sum}")).await?;
//! worker.request_termination().result().await?;
//! # Ok(())
//! # }
//! ```

pub mod captured;
pub mod config;
pub mod error;
pub mod transfer;
pub mod worker;

pub use captured::{CaptureMode, Global};
pub use config::{PoolConfig, WorkerConfig};
pub use error::{Error, Result};
pub use transfer::{Transfer, TransferKind, TransferMode};
pub use worker::{
    FutureState, JobFuture, JobId, WaitForMultiple, Worker, WorkerId, WorkerPool, WorkerState,
    wait_for_multiple_futures,
};
