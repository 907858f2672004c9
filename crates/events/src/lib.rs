//! Quarry in-process progress bus.
//!
//! - [`ProgressBus`]: publish/subscribe hub backed by
//!   `tokio::sync::broadcast`, shared via `Arc<ProgressBus>`.
//! - [`ProgressEvent`]: one persisted progress update, tagged with the
//!   result it belongs to and its log sequence.
//! - [`ResultSubscription`]: a receiver filtered to a single result.

pub mod bus;

pub use bus::{ProgressBus, ProgressEvent, ResultSubscription, SubscriptionError};
