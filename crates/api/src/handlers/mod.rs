//! Request handlers.
//!
//! Handlers delegate to the Result Store, the dispatcher and the stream
//! relay held in [`AppState`](crate::state::AppState) and map errors via
//! [`AppError`](crate::error::AppError).

pub mod research;
pub mod stream;
