//! Shared domain types for Stepflow.
//!
//! This crate contains the core domain types used across the Stepflow engine:
//! workflow definitions, execution records, callback payloads, configuration,
//! and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod callback;
pub mod config;
pub mod error;
pub mod execution;
pub mod workflow;
