//! Infrastructure adapters and runtime bootstrap.

pub mod artifacts;
pub mod chromium;
pub mod error;
pub mod http;
pub mod state_store;
pub mod telemetry;
