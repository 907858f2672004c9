//! Quarry API server library.
//!
//! Exposes the building blocks (config, state, error handling, routes, the
//! job dispatcher and the stream relay) so integration tests and the binary
//! entrypoint can both access them.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod relay;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
