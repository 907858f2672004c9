//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async query methods.
//! Methods that may run inside a transaction accept any `PgExecutor`;
//! read-only lookups take `&PgPool`.

pub mod queue_job_repo;
pub mod research_repo;
pub mod result_repo;

pub use queue_job_repo::QueueJobRepo;
pub use research_repo::ResearchRepo;
pub use result_repo::ResultRepo;
