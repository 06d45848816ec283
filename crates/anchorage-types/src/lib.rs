//! Shared domain types for Anchorage.
//!
//! This crate contains the event-sourced workflow record (`WorkflowState`,
//! `HistoryEvent`), caller-facing options, the retry policy value object,
//! engine configuration, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod duration;
pub mod error;
pub mod workflow;
