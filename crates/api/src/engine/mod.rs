//! Job submission engine.
//!
//! Contains the dispatcher that turns research requests into keyed queue
//! jobs for the generation worker pool.

pub mod dispatcher;

pub use dispatcher::{ResearchDispatcher, SubmissionError};
