//! Infrastructure layer for Anchorage.
//!
//! Contains implementations of the ports defined in `anchorage-core`: the
//! SQLite-backed `WorkflowStore` and the TOML engine-config loader.

pub mod config;
pub mod sqlite;
