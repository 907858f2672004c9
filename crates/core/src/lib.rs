//! Domain building blocks shared by every Quarry crate.
//!
//! Pure types, constants and policy functions only: no I/O and no
//! dependency on the storage, queue or HTTP layers.

pub mod error;
pub mod jobs;
pub mod progress;
pub mod research;
pub mod stream_events;
pub mod types;
