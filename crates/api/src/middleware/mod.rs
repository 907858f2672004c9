//! Request extractors.
//!
//! - [`caller::CallerId`] -- The opaque caller id supplied by the external auth layer.

pub mod caller;
