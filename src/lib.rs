//! Social preview card rendering and incremental artifact synchronization.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
