//! Client for the upstream streaming workflow service.
//!
//! Provides the byte-level frame decoder, typed workflow event parsing,
//! the HTTP client that opens a streamed run, and the
//! [`GenerationService`] seam the worker depends on.

pub mod api;
pub mod config;
pub mod frames;
pub mod messages;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod stream;

pub use api::{ByteStream, GenerationService, WorkflowApi, WorkflowError, WorkflowRunRequest};
pub use config::WorkflowConfig;
pub use frames::{FrameDecoder, FrameError};
pub use messages::{parse_frame, WorkflowEvent};
pub use stream::WorkflowStream;
