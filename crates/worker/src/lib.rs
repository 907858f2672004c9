//! Quarry generation worker.
//!
//! - [`processor::GenerationWorker`]: consumes one upstream workflow run
//!   for a research job and persists its progress.
//! - [`runner::JobRunner`]: runs a claimed job with lock renewal and
//!   reports its outcome to the queue.
//! - [`pool::WorkerPool`]: claim loops, lock renewal, stalled-job recovery
//!   and completed-job pruning on top of a [`quarry_db::queue::JobQueue`].

pub mod config;
pub mod outputs;
pub mod pool;
pub mod processor;
pub mod runner;

pub use config::{QueueConfig, WorkerConfig};
pub use pool::WorkerPool;
pub use processor::{GenerationError, GenerationSummary, GenerationWorker};
pub use runner::{JobOutcome, JobRunner};
