//! Application services: rendering, batching, diffing and sync orchestration.

pub mod batch;
pub mod browser;
pub mod bulk;
pub mod card;
pub mod diff;
pub mod error;
pub mod render;
pub mod state;
pub mod sweep;
pub mod sync;
