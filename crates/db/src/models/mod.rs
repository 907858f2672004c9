//! Row structs and DTOs.
//!
//! Each submodule contains:
//! - `FromRow` + `Serialize` entity structs matching the database rows
//! - Input DTOs for inserts and partial updates

pub mod job;
pub mod research;
