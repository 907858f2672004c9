//! Stream relay: forwards a result's generation progress to one SSE client.
//!
//! - [`frame`]: typed frames and log coalescing.
//! - [`connection`]: the per-connection state machine and its sink.
//! - [`live`]: relay-driven generation for live connections.

pub mod connection;
pub mod frame;
pub mod live;

pub use connection::{
    FrameSink, RelayConnection, RelayDeps, RelayMode, RelayRequest, RelayState, SinkError,
};
pub use frame::RelayFrame;
pub use live::LiveRuns;
