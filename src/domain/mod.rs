//! Domain layer types and invariants.

pub mod artifact;
pub mod error;
pub mod route;
pub mod snapshot;
