//! Server-Sent Event names emitted by the stream relay.
//!
//! Used in `quarry-api/src/relay/frame.rs` as the `event:` field of every
//! frame written to a connected client.

/// Sent once, immediately after the connection is accepted.
pub const EVENT_CONNECTED: &str = "connected";

/// Generation started (progress 10).
pub const EVENT_START: &str = "start";

/// Free-text status label with optional progress.
pub const EVENT_STATUS: &str = "status";

/// Newly appended content, or a full replacement when `replace` is set.
pub const EVENT_CONTENT: &str = "content";

/// Source list replaced.
pub const EVENT_SOURCES: &str = "sources";

/// Related item list replaced.
pub const EVENT_RELATED: &str = "related";

/// Structured chart data replaced.
pub const EVENT_DATA: &str = "data";

/// Keep-alive.
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// The result is complete; the stream closes after this frame.
pub const EVENT_COMPLETE: &str = "complete";

/// Unrecoverable failure; the stream closes after this frame.
pub const EVENT_ERROR: &str = "error";
